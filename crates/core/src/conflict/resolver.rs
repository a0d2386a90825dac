//! Pairwise merge of competing revisions and the fold over a conflict set.
//!
//! Content conflicts are never unresolvable: both sides are kept, joined by a
//! visible marker, so the user can pick what survives. Children lists that
//! diverged are unioned. Two revisions with the same content and children
//! have nothing to merge.

use tracing::{debug, info, warn};

use crate::config::ConflictConfig;
use crate::errors::ConflictError;
use crate::models::Revision;

/// Outcome of merging two revisions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// A synthetic revision combining both inputs.
    Merged(Revision),
    /// Both revisions carry the same payload; either one can be dropped.
    NoMerge,
    /// The revisions cannot be combined at all.
    Failed(String),
}

/// Merges competing revisions of one node.
#[derive(Debug, Clone, Default)]
pub struct ConflictResolver {
    config: ConflictConfig,
}

impl ConflictResolver {
    pub fn new(config: ConflictConfig) -> Self {
        Self { config }
    }

    /// Merge `a` with `b`. The merged revision is a copy of `a`.
    pub fn resolve(&self, a: &Revision, b: &Revision) -> Resolution {
        if a.id != b.id {
            return Resolution::Failed(format!(
                "revisions belong to different nodes ('{}' vs '{}')",
                a.id, b.id
            ));
        }

        if a.content != b.content {
            let mut merged = a.clone();
            merged.content = format!("{}{}{}", a.content, self.config.marker, b.content);
            return Resolution::Merged(merged);
        }

        if a.children != b.children {
            let mut merged = a.clone();
            merged.children = union_children(&a.children, &b.children);
            return Resolution::Merged(merged);
        }

        Resolution::NoMerge
    }

    /// Fold a whole conflict set into one winning revision.
    ///
    /// Revisions are put in canonical order (generation, then marker) so
    /// every replica folds the same set the same way. The fold starts from
    /// the last revision and combines each remaining one into it as
    /// `resolve(revision, winning)`.
    pub fn fold(&self, id: &str, mut revisions: Vec<Revision>) -> Result<Revision, ConflictError> {
        revisions.sort_by(|a, b| (a.generation(), &a.rev).cmp(&(b.generation(), &b.rev)));
        revisions.dedup_by(|a, b| a.rev == b.rev);

        let mut winning = revisions
            .pop()
            .ok_or_else(|| ConflictError::EmptyConflictSet(id.to_string()))?;
        info!(id, revisions = revisions.len() + 1, "folding conflict set");

        for revision in &revisions {
            match self.resolve(revision, &winning) {
                Resolution::Merged(merged) => {
                    debug!(id, rev = %revision.rev, "merged revision into winner");
                    winning = merged;
                }
                Resolution::NoMerge if self.config.strict_identical => {
                    warn!(id, rev = %revision.rev, "identical revisions in strict mode");
                    return Err(ConflictError::ResolutionFailed {
                        id: id.to_string(),
                        reason: format!(
                            "revision {} is identical to {} and strict mode is on",
                            revision.rev, winning.rev
                        ),
                    });
                }
                Resolution::NoMerge => {
                    debug!(id, rev = %revision.rev, "dropping identical revision");
                }
                Resolution::Failed(reason) => {
                    warn!(id, rev = %revision.rev, reason = %reason, "merge failed");
                    return Err(ConflictError::ResolutionFailed {
                        id: id.to_string(),
                        reason,
                    });
                }
            }
        }

        Ok(winning)
    }
}

/// Ordered set union: `a` in its order, then ids only `b` has, no duplicates.
pub fn union_children(a: &[String], b: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(a.len() + b.len());
    for child in a.iter().chain(b) {
        if !out.contains(child) {
            out.push(child.clone());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_CONFLICT_MARKER;

    fn rev(rev: &str, content: &str, children: &[&str]) -> Revision {
        Revision {
            id: "n".into(),
            rev: rev.into(),
            content: content.into(),
            children: children.iter().map(|c| c.to_string()).collect(),
            deleted: false,
        }
    }

    #[test]
    fn test_content_conflict_keeps_both_sides() {
        let resolver = ConflictResolver::default();
        let a = rev("2-a", "foo", &[]);
        let b = rev("2-b", "bar", &[]);
        match resolver.resolve(&a, &b) {
            Resolution::Merged(m) => {
                assert_eq!(m.content, "foo\n=====CONFLICT=====\nbar");
                assert_eq!(m.rev, "2-a");
            }
            other => panic!("expected merge, got {other:?}"),
        }
    }

    #[test]
    fn test_children_union() {
        let resolver = ConflictResolver::default();
        let a = rev("2-a", "x", &["c1", "c2"]);
        let b = rev("2-b", "x", &["c2", "c3"]);
        match resolver.resolve(&a, &b) {
            Resolution::Merged(m) => assert_eq!(m.children, vec!["c1", "c2", "c3"]),
            other => panic!("expected merge, got {other:?}"),
        }
    }

    #[test]
    fn test_content_takes_precedence_over_children() {
        let resolver = ConflictResolver::default();
        let a = rev("2-a", "x", &["c1"]);
        let b = rev("2-b", "y", &["c2"]);
        let Resolution::Merged(m) = resolver.resolve(&a, &b) else {
            panic!("expected merge");
        };
        assert_eq!(m.children, vec!["c1"]);
        assert!(m.content.contains(DEFAULT_CONFLICT_MARKER));
    }

    #[test]
    fn test_identical_revisions() {
        let resolver = ConflictResolver::default();
        let a = rev("2-a", "x", &["c"]);
        let b = rev("2-b", "x", &["c"]);
        assert_eq!(resolver.resolve(&a, &b), Resolution::NoMerge);
    }

    #[test]
    fn test_different_nodes_fail() {
        let resolver = ConflictResolver::default();
        let a = rev("2-a", "x", &[]);
        let mut b = rev("2-b", "y", &[]);
        b.id = "other".into();
        assert!(matches!(resolver.resolve(&a, &b), Resolution::Failed(_)));
    }

    #[test]
    fn test_deleted_content_still_conflicts() {
        let resolver = ConflictResolver::default();
        let a = rev("2-a", "kept", &[]);
        let mut b = rev("2-b", "", &[]);
        b.deleted = true;
        let Resolution::Merged(m) = resolver.resolve(&a, &b) else {
            panic!("expected merge");
        };
        assert_eq!(m.content, "kept\n=====CONFLICT=====\n");
    }

    #[test]
    fn test_fold_starts_from_last_in_canonical_order() {
        let resolver = ConflictResolver::default();
        let revisions = vec![
            rev("2-b", "B", &[]),
            rev("2-a", "A", &[]),
            rev("2-c", "C", &[]),
        ];
        let winner = resolver.fold("n", revisions).unwrap();
        // Canonical order is 2-a, 2-b, 2-c; start from 2-c, fold 2-a then 2-b.
        let m = DEFAULT_CONFLICT_MARKER;
        assert_eq!(winner.content, format!("B{m}A{m}C"));
        assert_eq!(winner.rev, "2-b");
    }

    #[test]
    fn test_fold_converges_for_every_permutation() {
        let resolver = ConflictResolver::default();
        let base = vec![
            rev("3-x", "one", &["a"]),
            rev("2-y", "two", &["b"]),
            rev("3-z", "one", &["c"]),
            rev("4-w", "three", &["a", "d"]),
        ];
        let expected = resolver.fold("n", base.clone()).unwrap();

        let mut permutation = base;
        for i in 0..permutation.len() {
            for j in 0..permutation.len() {
                permutation.swap(i, j);
                let winner = resolver.fold("n", permutation.clone()).unwrap();
                assert_eq!(winner.content, expected.content);
                assert_eq!(winner.children, expected.children);
            }
        }
    }

    #[test]
    fn test_fold_drops_identical_duplicates() {
        let resolver = ConflictResolver::default();
        let revisions = vec![rev("2-a", "same", &["c"]), rev("2-b", "same", &["c"])];
        let winner = resolver.fold("n", revisions).unwrap();
        assert_eq!(winner.rev, "2-b");
        assert_eq!(winner.content, "same");
    }

    #[test]
    fn test_fold_strict_mode_rejects_identical() {
        let resolver = ConflictResolver::new(ConflictConfig {
            strict_identical: true,
            ..ConflictConfig::default()
        });
        let revisions = vec![rev("2-a", "same", &[]), rev("2-b", "same", &[])];
        let err = resolver.fold("n", revisions).unwrap_err();
        assert!(matches!(err, ConflictError::ResolutionFailed { .. }));
    }

    #[test]
    fn test_fold_empty_set() {
        let resolver = ConflictResolver::default();
        assert_eq!(
            resolver.fold("n", vec![]).unwrap_err(),
            ConflictError::EmptyConflictSet("n".into())
        );
    }

    #[test]
    fn test_fold_propagates_failure() {
        let resolver = ConflictResolver::default();
        let mut stray = rev("2-a", "x", &[]);
        stray.id = "elsewhere".into();
        let revisions = vec![stray, rev("2-b", "y", &[])];
        assert!(matches!(
            resolver.fold("n", revisions),
            Err(ConflictError::ResolutionFailed { .. })
        ));
    }

    #[test]
    fn test_union_children_dedups_within_side() {
        let a = vec!["x".to_string(), "x".to_string()];
        let b = vec!["y".to_string(), "x".to_string()];
        assert_eq!(union_children(&a, &b), vec!["x", "y"]);
    }
}
