//! Prompt construction for every model-facing stage.

use trusttable_llm::{CompletionRequest, PromptPurpose};

use crate::claims::{ClaimChain, ReasoningTrace};
use crate::table::{SchemaSnapshot, Table};
use crate::verdict::{AuditModule, EvidenceReport};

const DECOMPOSE_SYSTEM: &str = r#"You split a table-QA reasoning trace into atomic, checkable claims.
Emit one claim per reasoning step, in order, and classify each as one of:
- "lookup": reads a specific cell or entity from the table
- "filter": selects the rows that satisfy a condition
- "aggregate": counts, sums, averages, or takes a min/max over rows
- "compare": compares values already established
- "arithmetic": computes a new value from values already established
- "conclusion": the final answer; exactly one, always last
Indices start at 1 and increase. "depends_on" lists earlier indices only.
Reply with JSON: {"claims": [{"index": 1, "kind": "lookup", "text": "...", "depends_on": []}]}"#;

const SYNTHESIZE_SYSTEM: &str = r#"You write grounding programs that check a claim against a table.
A program is JSON: {"query": <query>, "expect": <expectation>}.
Queries ("type" field selects the operator):
  {"type": "rows"}
  {"type": "filter", "input": <query>, "predicate": <predicate>}
  {"type": "select", "input": <query>, "column": "<name>"}
  {"type": "order_by", "input": <query>, "column": "<name>", "descending": true, "limit": 1}
  {"type": "aggregate", "input": <query>, "func": "count|sum|avg|min|max", "column": "<name>"}
  {"type": "arith", "op": "add|sub|mul|div", "lhs": <query>, "rhs": <query>}
  {"type": "literal", "value": <value>}
Predicates:
  {"type": "compare", "column": "<name>", "op": "eq|ne|lt|le|gt|ge", "value": <value>}
  {"type": "contains", "column": "<name>", "needle": "<text>"}
  {"type": "and", "predicates": [...]}, {"type": "or", "predicates": [...]}, {"type": "not", "predicate": <predicate>}
Expectations:
  {"type": "equals", "value": <value>}        the result is exactly this value
  {"type": "contains_all", "values": [...]}   every value appears in the result
  {"type": "non_empty"}                        the result exists
  {"type": "count", "n": <integer>}            the result has this many rows or values
  {"type": "holds"}                            the claim only states an intent (e.g. "we need to check column X")
Use exact column names from the schema. Text matching ignores case and surrounding whitespace.
Express what the claim asserts; do not correct it. Reply with the JSON program only."#;

const FORMALIZE_SYSTEM: &str = r#"You translate a chain of claims into typed constraints for an SMT solver.
Reply with JSON:
{"variables": [{"name": "revenue", "kind": "numeric|text|date|boolean"}],
 "constraints": [
   {"type": "fact", "step": 1, "var": "revenue", "value": 100},
   {"type": "define", "step": 3, "var": "profit", "expr": {"type": "sub", "args": [{"type": "var", "name": "revenue"}, {"type": "var", "name": "cost"}]}},
   {"type": "compare", "step": 4, "lhs": <expr>, "op": "eq|ne|lt|le|gt|ge", "rhs": <expr>}],
 "conclusion": {"type": "value", "step": <conclusion index>, "target": "profit", "value": 60}}
Expressions: {"type": "num", "value": 1.5}, {"type": "text", "value": "..."}, {"type": "date", "value": "YYYY-MM-DD"},
{"type": "bool", "value": true}, {"type": "var", "name": "..."}, {"type": "add|sub|mul|max|min", "args": [...]},
{"type": "div", "args": [a, b]}, {"type": "neg|abs", "arg": <expr>}.
Every constraint cites the claim index it comes from. Encode only what the claims state; never add facts
a claim does not assert. For a qualitative conclusion use {"type": "holds", "step": n, "lhs": <expr>, "op": "...", "rhs": <expr>}.
In a value conclusion, "value" is what the conclusion claim itself asserts. Omit it only when the claim
states no explicit value; the stated final answer is used instead."#;

const REFINE_SYSTEM: &str = r#"You are a formal logic auditor repairing a reasoning chain that failed symbolic verification.
- Grounding failure: the chain cited data that is not in the table. Re-read the table and use only grounded facts.
- Logic failure: the conclusion does not follow. If a counter-example was found the proof is leaky; close the
  logical world by explicitly citing the values of all competing candidates from the table.
- Consistency failure: the stated answer disagrees with what the reasoning computes. Make them agree.
Write a corrected step-by-step reasoning chain and end with a final line of the form "Answer: <answer>"."#;

const GENERATE_SYSTEM: &str = r#"You answer questions about a table with step-by-step reasoning.
Cite the table values you use, show every computation, and end with a final line "Answer: <answer>"."#;

pub fn decompose(question: &str, trace: &ReasoningTrace) -> CompletionRequest {
    let user = format!(
        "### Question\n{question}\n\n### Reasoning trace\n{}\n\n### Stated answer\n{}\n\n\
         Decompose the trace into atomic claims. Return JSON.",
        trace.reasoning, trace.answer
    );
    CompletionRequest::structured(PromptPurpose::Decompose, DECOMPOSE_SYSTEM, user)
}

/// Depends only on the schema snapshot and the claim text, so equal
/// inputs always produce equal prompts.
pub fn synthesize_query(snapshot: &SchemaSnapshot, claim_text: &str) -> CompletionRequest {
    let columns = snapshot
        .columns
        .iter()
        .map(|c| format!("- {} ({})", c.name, c.kind))
        .collect::<Vec<_>>()
        .join("\n");
    let rows = snapshot
        .sample_rows
        .iter()
        .map(|row| {
            row.iter()
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
                .join(" | ")
        })
        .collect::<Vec<_>>()
        .join("\n");
    let user = format!(
        "### Table schema: {}\n{columns}\n\n### Sample rows\n{rows}\n\n### Claim\n\"{claim_text}\"\n\n\
         Write the grounding program.",
        snapshot.name
    );
    CompletionRequest::structured(PromptPurpose::SynthesizeQuery, SYNTHESIZE_SYSTEM, user)
}

pub fn formalize(question: &str, chain: &ClaimChain, answer: &str) -> CompletionRequest {
    let user = format!(
        "### Question\n{question}\n\n### Claims\n{}\n\n### Stated answer\n{answer}\n\n\
         The conclusion is claim {}. Formalize the chain. Return JSON.",
        chain.render(),
        chain.conclusion().index
    );
    CompletionRequest::structured(PromptPurpose::Formalize, FORMALIZE_SYSTEM, user)
}

/// Refinement prompt specialised by the module that failed first.
pub fn refine(
    question: &str,
    table: &Table,
    trace: &ReasoningTrace,
    evidence: &EvidenceReport,
) -> CompletionRequest {
    let instruction = match evidence.primary_module() {
        Some(AuditModule::Decomposer) => format!(
            "Your last reasoning could not be split into checkable steps. Table:\n{}\n\
             Write one short numbered step per fact or calculation and end with `Answer: <value>`.",
            table.render_markdown(Some(50))
        ),
        Some(AuditModule::FactChecker) => format!(
            "The grounding check failed. Here is the full table:\n{}\n\
             Correct the specific data error in the failing step and recompute.",
            table.render_markdown(None)
        ),
        Some(AuditModule::LogicAuditor) => format!(
            "The logic check failed. Table:\n{}\n\
             If a counter-example was found, your proof is leaky: enumerate the values of every \
             other candidate so no counter-example remains.",
            table.render_markdown(Some(50))
        ),
        Some(AuditModule::ConsistencyMonitor) => format!(
            "Your stated answer disagrees with what your reasoning computes. Table:\n{}\n\
             Decide which is right and make the final answer match the reasoning.",
            table.render_markdown(Some(50))
        ),
        None => table.render_markdown(Some(50)),
    };
    let user = format!(
        "### Question\n{question}\n\n### Failed reasoning trace\n{}\nAnswer: {}\n\n\
         ### Verifier feedback\n{}\n\n### Instruction\n{instruction}\n\n### Corrected reasoning chain:",
        trace.reasoning,
        trace.answer,
        evidence.render()
    );
    let mut request = CompletionRequest::text(PromptPurpose::Refine, REFINE_SYSTEM, user);
    request.temperature = 0.2;
    request
}

pub fn generate_trace(question: &str, table: &Table) -> CompletionRequest {
    let user = format!(
        "### Table: {}\n{}\n\n### Question\n{question}",
        table.name(),
        table.render_markdown(None)
    );
    CompletionRequest::text(PromptPurpose::GenerateTrace, GENERATE_SYSTEM, user)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> Table {
        Table::from_raw(
            "t",
            vec!["Team".into(), "Wins".into()],
            vec![vec!["Ajax".into(), "12".into()]],
        )
        .unwrap()
    }

    #[test]
    fn synthesis_prompt_is_deterministic() {
        let snap = table().schema_snapshot();
        let a = synthesize_query(&snap, "Ajax won 12 games");
        let b = synthesize_query(&snap, "Ajax won 12 games");
        assert_eq!(a, b);
        assert!(a.user.contains("- Wins (numeric)"));
        assert!(a.json_mode);
    }

    #[test]
    fn generate_prompt_includes_table() {
        let req = generate_trace("Who won most?", &table());
        assert!(req.user.contains("| Ajax | 12 |"));
        assert_eq!(req.purpose, PromptPurpose::GenerateTrace);
    }
}
