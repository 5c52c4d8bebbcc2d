//! Input/output mapping engine.
//!
//! Mappings arrive as `;`-separated `<source>:<destination>` rules in the
//! `input_mappings` and `output_mappings` environment variables. The engine
//! parses them into typed rules, expands dynamic selections, and produces an
//! ordered plan of symlink and transfer tasks executed around the user
//! command.
//!
//! Ordering is a hard invariant: every symlink task runs before any transfer
//! task in the pre-run phase. A transfer materializing a path that a later
//! symlink expects to create would silently break pipe semantics.

mod exec;
mod fsops;
mod plan;
mod rule;

use std::env;

pub use exec::MappingExecutor;
pub use plan::{MappingPlan, MappingTask, Selections, build_plan};
pub use rule::{InputRule, InputSource, OutputRule, OutputTarget};

use crate::gateway::GatewayError;

/// Expand `$VAR` and `${VAR}` references against the process environment,
/// the way the orchestrator's templates expect. Undefined variables expand
/// to the empty string; a `$` not followed by a name stays literal.
#[must_use]
pub fn expand_env(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.char_indices().peekable();

    while let Some((_, c)) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }

        match chars.peek() {
            Some(&(_, '{')) => {
                chars.next();
                let mut name = String::new();
                let mut closed = false;
                for (_, c) in chars.by_ref() {
                    if c == '}' {
                        closed = true;
                        break;
                    }
                    name.push(c);
                }
                if closed {
                    out.push_str(&env::var(&name).unwrap_or_default());
                } else {
                    out.push_str("${");
                    out.push_str(&name);
                }
            },
            Some(&(_, c)) if c == '_' || c.is_ascii_alphabetic() => {
                let mut name = String::new();
                while let Some(&(_, c)) = chars.peek() {
                    if c == '_' || c.is_ascii_alphanumeric() {
                        name.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                out.push_str(&env::var(&name).unwrap_or_default());
            },
            _ => out.push('$'),
        }
    }

    out
}

/// Mapping engine errors.
#[derive(Debug, thiserror::Error)]
pub enum MappingError {
    /// A rule was not exactly `<source>:<destination>`.
    #[error("invalid mapping syntax: {mapping:?}")]
    InvalidSyntax {
        /// The offending rule text.
        mapping: String,
    },

    /// An input source outside the allowed vocabulary.
    #[error("invalid source in input mappings: {value:?}")]
    InvalidInputSource {
        /// The offending source.
        value: String,
    },

    /// An output rule whose source is a remote prefix.
    #[error("invalid source in output mappings: {value:?}")]
    InvalidOutputSource {
        /// The offending source.
        value: String,
    },

    /// An output rule whose local source is not absolute.
    #[error("output mapping source must be an absolute path: {value:?}")]
    RelativeOutputSource {
        /// The offending source.
        value: String,
    },

    /// An output destination outside the allowed vocabulary.
    #[error("invalid destination in output mappings: {target:?}")]
    InvalidOutputTarget {
        /// The offending destination.
        target: String,
    },

    /// A selection source with no destination to land in.
    #[error("destination for {kind} mapping should be defined")]
    MissingSelectionDestination {
        /// Which selection source.
        kind: &'static str,
    },

    /// A selection source referenced with no selection in the environment.
    #[error("{kind} referenced in source but no selection detected")]
    EmptySelection {
        /// Which selection source.
        kind: &'static str,
    },

    /// `selected_files` into a single-file destination with more than one
    /// selected file.
    #[error("when destination is a file (without '/'), there should only be one selected file, got {count}")]
    SelectionCardinality {
        /// Number of selected files.
        count: usize,
    },

    /// A selection rule expanded into another selection rule.
    #[error("selection rules cannot expand into further selection rules")]
    NestedSelection,

    /// A destination that is still relative after defaulting.
    #[error("invalid destination path: always use absolute path, got {destination:?}")]
    RelativeDestination {
        /// The offending destination.
        destination: String,
    },

    /// A mounted file source that does not exist and cannot be lazily
    /// created because the rule does not denote a directory.
    #[error("file for data mounting from mounted storage does not exist: {path}")]
    MissingMountedSource {
        /// The missing source path.
        path: String,
    },

    /// The symlink destination is already a symlink from an earlier run or a
    /// conflicting mapping.
    #[error("destination {path:?} is already a symlink — conflicting mapping")]
    SymlinkConflict {
        /// The conflicting link path.
        path: String,
    },

    /// The created symlink closes a loop.
    #[error("symlink loop detected at {path:?}")]
    SymlinkLoop {
        /// The link path.
        path: String,
    },

    /// The created symlink does not resolve.
    #[error("error resolving symlink {path:?} after creation: {source}")]
    SymlinkResolve {
        /// The link path.
        path: String,
        /// Underlying io error.
        #[source]
        source: std::io::Error,
    },

    /// A graph-storage copy whose source is not a directory.
    #[error("source is not a directory: {path}")]
    NotADirectory {
        /// The offending source path.
        path: String,
    },

    /// A multi-file remote prefix mapped onto a single-file destination.
    #[error(
        "mapping {prefix}:{destination} -- destination should end with '/' when \
         mapping is from a remote folder with multiple files"
    )]
    MultiFileDestination {
        /// The remote prefix.
        prefix: String,
        /// The single-file destination.
        destination: String,
    },

    /// Local filesystem failure during a mapping task.
    #[error("io error on {path}: {source}")]
    Io {
        /// The local path involved.
        path: String,
        /// Underlying io error.
        #[source]
        source: std::io::Error,
    },

    /// A remote operation failed.
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_known_variable() {
        std::env::set_var("WKUBE_EXPAND_TEST_A", "proj");
        assert_eq!(expand_env("acc://$WKUBE_EXPAND_TEST_A/in:/data/"), "acc://proj/in:/data/");
        assert_eq!(expand_env("${WKUBE_EXPAND_TEST_A}/x"), "proj/x");
    }

    #[test]
    fn test_expand_env_unknown_variable_is_empty() {
        std::env::remove_var("WKUBE_EXPAND_TEST_MISSING");
        assert_eq!(expand_env("a$WKUBE_EXPAND_TEST_MISSING/b"), "a/b");
    }

    #[test]
    fn test_expand_env_literal_dollar() {
        assert_eq!(expand_env("cost: 5$"), "cost: 5$");
        assert_eq!(expand_env("$ alone"), "$ alone");
    }
}
