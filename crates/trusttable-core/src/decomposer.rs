//! Decomposer: reasoning trace to ordered atomic claims.

use serde::Deserialize;

use crate::claims::{AtomicClaim, ClaimChain, DecompositionError, ReasoningTrace};
use crate::error::Result;
use crate::execution::ModelGate;
use crate::prompts;

#[derive(Deserialize)]
#[serde(untagged)]
enum DecompositionReply {
    Wrapped {
        #[serde(alias = "steps")]
        claims: Vec<AtomicClaim>,
    },
    Bare(Vec<AtomicClaim>),
}

/// Parse and validate a decomposition reply.
pub fn parse_claims(text: &str) -> std::result::Result<ClaimChain, DecompositionError> {
    let reply: DecompositionReply =
        serde_json::from_str(text).map_err(|e| DecompositionError::Malformed(e.to_string()))?;
    let claims = match reply {
        DecompositionReply::Wrapped { claims } | DecompositionReply::Bare(claims) => claims,
    };
    ClaimChain::new(claims)
}

/// Decompose `trace` into a validated claim chain.
///
/// Malformed replies are re-prompted with the validation error; if the
/// model never produces a valid chain the error is
/// [`AuditError::Decomposition`](crate::error::AuditError::Decomposition).
pub async fn decompose(
    gate: &ModelGate,
    question: &str,
    trace: &ReasoningTrace,
) -> Result<ClaimChain> {
    let request = prompts::decompose(question, trace);
    match gate.complete_parsed(&request, parse_claims).await? {
        Ok(chain) => {
            tracing::debug!(claims = chain.len(), "trace decomposed");
            Ok(chain)
        }
        Err(malformed) => {
            tracing::warn!(
                attempts = malformed.attempts,
                error = %malformed.error,
                "decomposition failed"
            );
            Err(malformed.error.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claims::ClaimKind;

    #[test]
    fn accepts_wrapped_and_bare_replies() {
        let wrapped = parse_claims(
            r#"{"claims": [{"index": 1, "kind": "lookup", "text": "a"},
                           {"index": 2, "kind": "conclusion", "text": "b", "depends_on": [1]}]}"#,
        )
        .unwrap();
        assert_eq!(wrapped.len(), 2);

        let bare = parse_claims(r#"[{"step": 1, "type": "conclusion", "content": "x"}]"#).unwrap();
        assert_eq!(bare.conclusion().kind, ClaimKind::Conclusion);
    }

    #[test]
    fn structural_errors_surface() {
        assert!(matches!(parse_claims("oops"), Err(DecompositionError::Malformed(_))));
        assert_eq!(
            parse_claims(r#"{"claims": [{"index": 1, "kind": "lookup", "text": "a"}]}"#),
            Err(DecompositionError::MissingConclusion)
        );
    }
}
