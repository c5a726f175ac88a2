// Prompt text for resume analysis. The keys requested here are the ones the
// response classifier checks for.

/// Longest slice of a resume sent to the model.
const MAX_RESUME_CHARS: usize = 12_000;

/// System prompt fragment that enforces JSON-only output.
pub const JSON_ONLY_SYSTEM: &str = "You are a precise, structured assistant. \
    You MUST respond with valid JSON only. \
    Do NOT include any text outside the JSON object. \
    Do NOT use markdown code fences. \
    Do NOT include explanations or apologies.";

const ANALYSIS_INSTRUCTIONS: &str = "\
Analyze this resume against the job description below.

CRITICAL INSTRUCTIONS:
1. DO NOT use generic phrases like \"seasoned expert\", \"proven track record\", \"perfect fit\", \
\"strong background\", or any statement that could apply to more than 30% of applicants.
2. CITE EVIDENCE: for every claim, include the exact verbatim quote from the resume \
that supports it.
3. If you cannot find a direct quote to support a claim, do not make that claim.
4. Prefer achievements with concrete numbers, measurable impact, or significant scope.
5. Extract every work experience from the resume, up to 5.

Return a JSON object with these exact keys:
- \"nickname\": a 2-3 word nickname based on their unique profile. No real names, no gender terms.
- \"summary\": a 2-3 line summary of specific experiences and achievements.
- \"differentiators\": an array of 3 objects {\"claim\", \"evidence\"}.
- \"reservations\": an array of 2-3 specific concerns or gaps for this role.
- \"relevant_achievements\": an array of exactly 4 objects {\"achievement\", \"evidence\"}.
- \"wildcard\": an object {\"fact\", \"evidence\"} with something unusual about the candidate.
- \"work_history\": an array of objects {\"title\", \"company\", \"years\"}, most recent first.
- \"experience_distribution\": years per sector as \
{\"corporate\", \"startup\", \"nonprofit\", \"government\", \"education\", \"other\"}.";

/// Builds the user prompt for one resume.
pub fn analysis_prompt(resume_text: &str, job_description: Option<&str>) -> String {
    let job = job_description
        .map(str::trim)
        .filter(|j| !j.is_empty())
        .unwrap_or("Not provided.");
    format!(
        "{ANALYSIS_INSTRUCTIONS}\n\nJob Description:\n{job}\n\nResume to analyze:\n{}",
        truncate_chars(resume_text, MAX_RESUME_CHARS)
    )
}

fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
