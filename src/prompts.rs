//! Prompt templates for compliance evaluation.
//!
//! Keeping every prompt here means changing the wording never touches the
//! retry, parsing or reconciliation code, and tests can inspect the exact
//! text sent to the model.
//!
//! Two templates exist, one per [`PromptProtocol`]. The structured template
//! asks for the JSON shape [`crate::pipeline::verdict`] parses; the legacy
//! template asks for a single status word.

use crate::config::PromptProtocol;

/// Structured-protocol instructions. The model must answer with the JSON
/// object described here; prose around it is tolerated.
pub const STRUCTURED_INSTRUCTIONS: &str = r#"Check the submission document against every requirement in the policy document.

Follow these rules precisely:

1. REQUIREMENTS
   - List each distinct requirement stated in the policy, one entry per requirement
   - Quantifiable requirements (amounts, dates, counts, limits) must be checked exactly
   - Quote or paraphrase the policy wording in "requirement"

2. JUDGEMENT
   - "pass": true when the submission meets the requirement, false otherwise
   - When a requirement is only partly met or the evidence is ambiguous, set
     "pass": true and "pass_status": "PARTIAL"
   - Put the evidence from the submission, or what is missing, in "notes"

3. SUMMARY
   - "totalChecks" is the number of requirement entries
   - "passed", "partial" and "failed" count the entries in each state
   - "statement" is one sentence giving the overall conclusion

4. OUTPUT FORMAT
   Respond with a single JSON object in a ```json fenced block:

```json
{
  "requirements": [
    {"requirement": "...", "pass": true, "pass_status": "PARTIAL", "notes": "..."}
  ],
  "summary": {"totalChecks": 0, "passed": 0, "partial": 0, "failed": 0, "statement": "..."}
}
```"#;

/// Legacy-protocol instructions: one status word plus an explanation.
pub const LEGACY_INSTRUCTIONS: &str = r#"Based on all these comparisons, respond with exactly one word (GREEN, YELLOW, ORANGE or RED).
In addition provide an explanation on how specific requirements are met (GREEN) or may not be met.

GREEN means all requirements (quantifiable/numerical and unquantifiable) are fully met.
YELLOW means all quantifiable/numerical requirements are met but other requirements are ambiguous.
ORANGE means both numerical and other requirements are ambiguous and need clarification.
RED means one or more requirements are clearly not met."#;

/// Build the full evaluation prompt for one policy/submission pair.
pub fn evaluation_prompt(protocol: PromptProtocol, policy: &str, submission: &str) -> String {
    let instructions = match protocol {
        PromptProtocol::Structured => STRUCTURED_INSTRUCTIONS,
        PromptProtocol::Legacy => LEGACY_INSTRUCTIONS,
    };
    format!(
        "Compare these two documents and determine if the submission document meets \
         the requirements specified in the policy document.\n\n\
         Policy Document:\n{}\n\n\
         Submission Document:\n{}\n\n\
         {}\n",
        policy.trim(),
        submission.trim(),
        instructions
    )
}
