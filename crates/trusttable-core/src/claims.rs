//! Reasoning traces, samples and the atomic claim chain.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::table::RawTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimKind {
    Lookup,
    Filter,
    Aggregate,
    Compare,
    Arithmetic,
    Conclusion,
}

impl ClaimKind {
    /// Whether claims of this kind assert something about table content.
    pub fn references_table(self) -> bool {
        matches!(self, ClaimKind::Lookup | ClaimKind::Filter | ClaimKind::Aggregate)
    }
}

impl fmt::Display for ClaimKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ClaimKind::Lookup => "lookup",
            ClaimKind::Filter => "filter",
            ClaimKind::Aggregate => "aggregate",
            ClaimKind::Compare => "compare",
            ClaimKind::Arithmetic => "arithmetic",
            ClaimKind::Conclusion => "conclusion",
        };
        f.write_str(s)
    }
}

/// One decomposed reasoning step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AtomicClaim {
    #[serde(alias = "step")]
    pub index: u32,
    #[serde(alias = "type")]
    pub kind: ClaimKind,
    #[serde(alias = "content")]
    pub text: String,
    #[serde(default)]
    pub depends_on: Vec<u32>,
}

impl AtomicClaim {
    pub fn new(index: u32, kind: ClaimKind, text: impl Into<String>) -> Self {
        Self {
            index,
            kind,
            text: text.into(),
            depends_on: Vec::new(),
        }
    }

    pub fn depends_on(mut self, indices: &[u32]) -> Self {
        self.depends_on = indices.to_vec();
        self
    }
}

#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum DecompositionError {
    #[error("malformed decomposition: {0}")]
    Malformed(String),

    #[error("decomposition produced no claims")]
    Empty,

    #[error("claim index {index} does not follow {previous}")]
    NonIncreasing { index: u32, previous: u32 },

    #[error("claim {index} depends on {reference}, which is not an earlier claim")]
    ForwardReference { index: u32, reference: u32 },

    #[error("no conclusion claim")]
    MissingConclusion,

    #[error("conclusion claim {0} is not the last claim")]
    ConclusionNotLast(u32),

    #[error("more than one conclusion claim")]
    MultipleConclusions,
}

/// Ordered, validated claims of one trace.
///
/// Indices strictly increase, dependencies point only at earlier claims,
/// and exactly one conclusion closes the chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "Vec<AtomicClaim>", try_from = "Vec<AtomicClaim>")]
pub struct ClaimChain {
    claims: Vec<AtomicClaim>,
}

impl ClaimChain {
    pub fn new(claims: Vec<AtomicClaim>) -> Result<Self, DecompositionError> {
        let Some(last) = claims.last() else {
            return Err(DecompositionError::Empty);
        };

        let mut previous: Option<u32> = None;
        for claim in &claims {
            if let Some(prev) = previous {
                if claim.index <= prev {
                    return Err(DecompositionError::NonIncreasing {
                        index: claim.index,
                        previous: prev,
                    });
                }
            }
            for &reference in &claim.depends_on {
                let earlier = reference < claim.index && claims.iter().any(|c| c.index == reference);
                if !earlier {
                    return Err(DecompositionError::ForwardReference {
                        index: claim.index,
                        reference,
                    });
                }
            }
            previous = Some(claim.index);
        }

        let conclusions = claims
            .iter()
            .filter(|c| c.kind == ClaimKind::Conclusion)
            .count();
        match conclusions {
            0 => return Err(DecompositionError::MissingConclusion),
            1 => {}
            _ => return Err(DecompositionError::MultipleConclusions),
        }
        if last.kind != ClaimKind::Conclusion {
            let index = claims
                .iter()
                .find(|c| c.kind == ClaimKind::Conclusion)
                .map(|c| c.index)
                .unwrap_or(last.index);
            return Err(DecompositionError::ConclusionNotLast(index));
        }

        Ok(Self { claims })
    }

    pub fn claims(&self) -> &[AtomicClaim] {
        &self.claims
    }

    pub fn len(&self) -> usize {
        self.claims.len()
    }

    pub fn is_empty(&self) -> bool {
        self.claims.is_empty()
    }

    pub fn get(&self, index: u32) -> Option<&AtomicClaim> {
        self.claims.iter().find(|c| c.index == index)
    }

    /// The closing conclusion claim.
    pub fn conclusion(&self) -> &AtomicClaim {
        &self.claims[self.claims.len() - 1]
    }

    /// Claims the FactChecker must ground, in chain order.
    pub fn table_claims(&self) -> impl Iterator<Item = &AtomicClaim> {
        self.claims.iter().filter(|c| c.kind.references_table())
    }

    /// Numbered plain-text rendering for prompts.
    pub fn render(&self) -> String {
        self.claims
            .iter()
            .map(|c| {
                let deps = if c.depends_on.is_empty() {
                    String::new()
                } else {
                    format!(
                        " (uses {})",
                        c.depends_on
                            .iter()
                            .map(u32::to_string)
                            .collect::<Vec<_>>()
                            .join(", ")
                    )
                };
                format!("{}. [{}] {}{}", c.index, c.kind, c.text, deps)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl TryFrom<Vec<AtomicClaim>> for ClaimChain {
    type Error = DecompositionError;

    fn try_from(claims: Vec<AtomicClaim>) -> Result<Self, Self::Error> {
        Self::new(claims)
    }
}

impl From<ClaimChain> for Vec<AtomicClaim> {
    fn from(chain: ClaimChain) -> Self {
        chain.claims
    }
}

/// A model's chain of reasoning and its declared final answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReasoningTrace {
    pub reasoning: String,
    pub answer: String,
}

impl ReasoningTrace {
    pub fn new(reasoning: impl Into<String>, answer: impl Into<String>) -> Self {
        Self {
            reasoning: reasoning.into(),
            answer: answer.into(),
        }
    }
}

/// One dataset entry to audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub id: String,
    pub question: String,
    pub table: RawTable,
    /// Generated from (table, question) when absent.
    #[serde(default)]
    pub trace: Option<ReasoningTrace>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(claims: Vec<AtomicClaim>) -> Result<ClaimChain, DecompositionError> {
        ClaimChain::new(claims)
    }

    #[test]
    fn valid_chain() {
        let c = chain(vec![
            AtomicClaim::new(1, ClaimKind::Lookup, "Revenue is 100"),
            AtomicClaim::new(2, ClaimKind::Lookup, "Cost is 40"),
            AtomicClaim::new(3, ClaimKind::Arithmetic, "Profit is 100 - 40 = 60").depends_on(&[1, 2]),
            AtomicClaim::new(4, ClaimKind::Conclusion, "Profit is 60").depends_on(&[3]),
        ])
        .unwrap();
        assert_eq!(c.table_claims().count(), 2);
        assert_eq!(c.conclusion().index, 4);
        assert!(c.render().contains("3. [arithmetic] Profit is 100 - 40 = 60 (uses 1, 2)"));
    }

    #[test]
    fn rejects_structural_errors() {
        assert_eq!(chain(vec![]), Err(DecompositionError::Empty));
        assert_eq!(
            chain(vec![
                AtomicClaim::new(2, ClaimKind::Lookup, "a"),
                AtomicClaim::new(2, ClaimKind::Conclusion, "b"),
            ]),
            Err(DecompositionError::NonIncreasing { index: 2, previous: 2 })
        );
        assert_eq!(
            chain(vec![
                AtomicClaim::new(1, ClaimKind::Lookup, "a").depends_on(&[2]),
                AtomicClaim::new(2, ClaimKind::Conclusion, "b"),
            ]),
            Err(DecompositionError::ForwardReference { index: 1, reference: 2 })
        );
        assert_eq!(
            chain(vec![AtomicClaim::new(1, ClaimKind::Lookup, "a")]),
            Err(DecompositionError::MissingConclusion)
        );
        assert_eq!(
            chain(vec![
                AtomicClaim::new(1, ClaimKind::Conclusion, "a"),
                AtomicClaim::new(2, ClaimKind::Lookup, "b"),
            ]),
            Err(DecompositionError::ConclusionNotLast(1))
        );
    }

    #[test]
    fn accepts_step_content_aliases() {
        let claim: AtomicClaim =
            serde_json::from_str(r#"{"step": 1, "type": "lookup", "content": "x"}"#).unwrap();
        assert_eq!(claim, AtomicClaim::new(1, ClaimKind::Lookup, "x"));
    }
}
