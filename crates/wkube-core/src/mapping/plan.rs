//! Plan construction: typed rules in, ordered task queues out.
//!
//! Selection sources expand into concrete remote rules and are fed back
//! through the same resolver; an expansion can never produce another
//! selection, so the recursion is bounded at depth one.

use super::rule::{
    InputRule, InputSource, OutputRule, OutputTarget, parse_input_rule, parse_output_rule,
};
use super::{MappingError, expand_env};

/// Selection lists supplied by the orchestrator through the environment.
#[derive(Debug, Clone, Default)]
pub struct Selections {
    /// Entries of `selected_filenames`, split on commas; `None` when unset.
    pub files: Option<Vec<String>>,

    /// Entries of `selected_foldernames`, split on commas; `None` when unset.
    pub folders: Option<Vec<String>>,
}

/// One concrete unit of mapping work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MappingTask {
    /// Create a symlink at `link` pointing to `mounted`. Used for both
    /// directions of pipe sharing; only the roles of the rule ends differ.
    Symlink {
        /// Path on the mounted pipe volume the link resolves to.
        mounted: String,
        /// Local path at which the link is created.
        link: String,
    },

    /// Recursively copy a graph-volume directory to a local path.
    CopyFromGraph {
        /// Source directory on the graph volume.
        source: String,
        /// Local destination directory.
        destination: String,
    },

    /// Enumerate a remote prefix and download every object under it.
    DownloadPrefix {
        /// Remote prefix (without the `acc://` scheme).
        prefix: String,
        /// Local destination; a trailing `/` denotes a directory target.
        destination: String,
    },

    /// Recursively copy a local directory onto the graph volume.
    CopyToGraph {
        /// Local source directory.
        source: String,
        /// Destination directory on the graph volume.
        destination: String,
    },

    /// Upload a local file or directory tree to a remote prefix.
    UploadPrefix {
        /// Local source path.
        source: String,
        /// Remote prefix (without the `acc://` scheme).
        destination: String,
    },
}

/// Ordered mapping plan. Within each queue tasks run serially in order; the
/// symlink queue always runs before any transfer.
#[derive(Debug, Clone, Default)]
pub struct MappingPlan {
    /// Symlink tasks, run first in the pre-run phase. Input-derived links
    /// come before output-derived ones.
    pub symlinks: Vec<MappingTask>,

    /// Input transfers (downloads and graph copies), run pre-command.
    pub input_transfers: Vec<MappingTask>,

    /// Output transfers (uploads and graph copies), run post-command.
    pub output_transfers: Vec<MappingTask>,
}

impl MappingPlan {
    /// Whether the plan contains no work at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.symlinks.is_empty()
            && self.input_transfers.is_empty()
            && self.output_transfers.is_empty()
    }
}

/// Parse both mapping expressions and build the ordered plan.
///
/// Environment references inside the expressions are expanded first, the way
/// the orchestrator's templating expects.
///
/// # Errors
///
/// Returns the first parse, validation, or selection-expansion error. No
/// filesystem mutation happens here; a rejected plan has no side effects.
pub fn build_plan(
    input_mappings: &str,
    output_mappings: &str,
    selections: &Selections,
) -> Result<MappingPlan, MappingError> {
    let mut plan = MappingPlan::default();

    let input_mappings = expand_env(input_mappings);
    for raw in input_mappings.split(';') {
        if let Some(parsed) = parse_input_rule(raw)? {
            resolve_input(parsed, selections, 0, &mut plan)?;
        }
    }

    let output_mappings = expand_env(output_mappings);
    for raw in output_mappings.split(';') {
        if let Some(parsed) = parse_output_rule(raw)? {
            resolve_output(parsed, &mut plan);
        }
    }

    Ok(plan)
}

fn resolve_input(
    parsed: InputRule,
    selections: &Selections,
    depth: u8,
    plan: &mut MappingPlan,
) -> Result<(), MappingError> {
    match parsed.source {
        InputSource::SelectedFiles | InputSource::SelectedFolders if depth > 0 => {
            Err(MappingError::NestedSelection)
        },
        InputSource::SelectedFolders => {
            expand_folders(&parsed.destination, selections, depth, plan)
        },
        InputSource::SelectedFiles => expand_files(&parsed.destination, selections, depth, plan),
        source => {
            let destination = default_destination(&source, parsed.destination)?;
            match source {
                InputSource::MountedPipe(mounted) => plan.symlinks.push(MappingTask::Symlink {
                    mounted,
                    link: destination,
                }),
                InputSource::MountedGraph(source) => {
                    plan.input_transfers.push(MappingTask::CopyFromGraph {
                        source,
                        destination,
                    });
                },
                InputSource::Remote(prefix) => {
                    plan.input_transfers.push(MappingTask::DownloadPrefix {
                        prefix,
                        destination,
                    });
                },
                InputSource::SelectedFiles | InputSource::SelectedFolders => unreachable!(),
            }
            Ok(())
        },
    }
}

/// Apply destination defaulting and the `/*` glob rewrite, then enforce the
/// absolute-path invariant.
fn default_destination(
    source: &InputSource,
    destination: String,
) -> Result<String, MappingError> {
    let destination = match source {
        InputSource::Remote(prefix) if destination.is_empty() => format!("/{prefix}"),
        InputSource::Remote(prefix) if destination.ends_with("/*") => {
            format!("{}/{prefix}", destination.trim_end_matches("/*"))
        },
        _ => destination,
    };

    if !destination.starts_with('/') {
        return Err(MappingError::RelativeDestination { destination });
    }
    Ok(destination)
}

fn expand_folders(
    destination: &str,
    selections: &Selections,
    depth: u8,
    plan: &mut MappingPlan,
) -> Result<(), MappingError> {
    if destination.is_empty() {
        return Err(MappingError::MissingSelectionDestination {
            kind: "selected_folders",
        });
    }

    let Some(folders) = &selections.folders else {
        return Err(MappingError::EmptySelection {
            kind: "selected_folders",
        });
    };

    for folder in folders.iter().filter(|f| !f.is_empty()) {
        let expanded = InputRule {
            source: InputSource::Remote(folder.clone()),
            destination: destination.to_string(),
        };
        resolve_input(expanded, selections, depth + 1, plan)?;
    }
    Ok(())
}

fn expand_files(
    destination: &str,
    selections: &Selections,
    depth: u8,
    plan: &mut MappingPlan,
) -> Result<(), MappingError> {
    if destination.is_empty() {
        return Err(MappingError::MissingSelectionDestination {
            kind: "selected_files",
        });
    }

    let Some(files) = &selections.files else {
        return Err(MappingError::EmptySelection {
            kind: "selected_files",
        });
    };

    if destination.ends_with('/') {
        for file in files.iter().filter(|f| !f.is_empty()) {
            let expanded = InputRule {
                source: InputSource::Remote(file.clone()),
                destination: format!("{destination}{file}"),
            };
            resolve_input(expanded, selections, depth + 1, plan)?;
        }
        return Ok(());
    }

    if files.len() > 1 {
        return Err(MappingError::SelectionCardinality { count: files.len() });
    }
    if let Some(file) = files.first().filter(|f| !f.is_empty()) {
        let expanded = InputRule {
            source: InputSource::Remote(file.clone()),
            destination: destination.to_string(),
        };
        resolve_input(expanded, selections, depth + 1, plan)?;
    }
    Ok(())
}

fn resolve_output(parsed: OutputRule, plan: &mut MappingPlan) {
    match parsed.destination {
        // Reverse-sense symlink, created pre-run: the local source path
        // becomes a link into the pipe volume so the command writes straight
        // into shared storage.
        OutputTarget::MountedPipe(mounted) => plan.symlinks.push(MappingTask::Symlink {
            mounted,
            link: parsed.source,
        }),
        OutputTarget::MountedGraph(destination) => {
            plan.output_transfers.push(MappingTask::CopyToGraph {
                source: parsed.source,
                destination,
            });
        },
        OutputTarget::Remote(prefix) => {
            plan.output_transfers.push(MappingTask::UploadPrefix {
                source: parsed.source,
                destination: prefix,
            });
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn selections(files: &[&str], folders: &[&str]) -> Selections {
        Selections {
            files: if files.is_empty() {
                None
            } else {
                Some(files.iter().map(ToString::to_string).collect())
            },
            folders: if folders.is_empty() {
                None
            } else {
                Some(folders.iter().map(ToString::to_string).collect())
            },
        }
    }

    #[test]
    fn test_happy_path_plan() {
        let plan = build_plan(
            "acc://proj/in:/data/in/",
            "/data/out:acc://proj/out/",
            &Selections::default(),
        )
        .unwrap();

        assert_eq!(
            plan.input_transfers,
            vec![MappingTask::DownloadPrefix {
                prefix: "proj/in".to_string(),
                destination: "/data/in/".to_string(),
            }]
        );
        assert_eq!(
            plan.output_transfers,
            vec![MappingTask::UploadPrefix {
                source: "/data/out".to_string(),
                destination: "proj/out/".to_string(),
            }]
        );
        assert!(plan.symlinks.is_empty());
    }

    #[test]
    fn test_symlinks_ordered_before_transfers() {
        let plan = build_plan(
            "acc://proj/in:/data/in/;/mnt/pipe/shared/:/data/shared",
            "/data/out:/mnt/pipe/out/;/data/bulk:/mnt/graph/bulk",
            &Selections::default(),
        )
        .unwrap();

        // Input-derived link first, then the output-derived reverse link.
        assert_eq!(
            plan.symlinks,
            vec![
                MappingTask::Symlink {
                    mounted: "/mnt/pipe/shared/".to_string(),
                    link: "/data/shared".to_string(),
                },
                MappingTask::Symlink {
                    mounted: "/mnt/pipe/out/".to_string(),
                    link: "/data/out".to_string(),
                },
            ]
        );
        assert_eq!(plan.input_transfers.len(), 1);
        assert_eq!(
            plan.output_transfers,
            vec![MappingTask::CopyToGraph {
                source: "/data/bulk".to_string(),
                destination: "/mnt/graph/bulk".to_string(),
            }]
        );
    }

    #[test]
    fn test_destination_defaulting() {
        let plan = build_plan("acc://proj/in:", "", &Selections::default()).unwrap();
        assert_eq!(
            plan.input_transfers,
            vec![MappingTask::DownloadPrefix {
                prefix: "proj/in".to_string(),
                destination: "/proj/in".to_string(),
            }]
        );
    }

    #[test]
    fn test_destination_glob_rewrite() {
        let plan = build_plan("acc://proj/in:/data/*", "", &Selections::default()).unwrap();
        assert_eq!(
            plan.input_transfers,
            vec![MappingTask::DownloadPrefix {
                prefix: "proj/in".to_string(),
                destination: "/data/proj/in".to_string(),
            }]
        );
    }

    #[test]
    fn test_relative_destination_rejected() {
        let err = build_plan("/mnt/pipe/x:relative/path", "", &Selections::default())
            .unwrap_err();
        assert!(matches!(err, MappingError::RelativeDestination { .. }));
    }

    #[test]
    fn test_selected_files_into_directory() {
        let plan = build_plan(
            "selected_files:/in/",
            "",
            &selections(&["a.txt", "b.txt"], &[]),
        )
        .unwrap();

        assert_eq!(
            plan.input_transfers,
            vec![
                MappingTask::DownloadPrefix {
                    prefix: "a.txt".to_string(),
                    destination: "/in/a.txt".to_string(),
                },
                MappingTask::DownloadPrefix {
                    prefix: "b.txt".to_string(),
                    destination: "/in/b.txt".to_string(),
                },
            ]
        );
    }

    #[test]
    fn test_selected_files_cardinality_violation() {
        let err = build_plan(
            "selected_files:/in/one.txt",
            "",
            &selections(&["a.txt", "b.txt"], &[]),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            MappingError::SelectionCardinality { count: 2 }
        ));
    }

    #[test]
    fn test_selected_files_single_file_destination() {
        let plan = build_plan(
            "selected_files:/in/one.txt",
            "",
            &selections(&["a.txt"], &[]),
        )
        .unwrap();
        assert_eq!(
            plan.input_transfers,
            vec![MappingTask::DownloadPrefix {
                prefix: "a.txt".to_string(),
                destination: "/in/one.txt".to_string(),
            }]
        );
    }

    #[test]
    fn test_selected_files_without_selection() {
        let err = build_plan("selected_files:/in/", "", &Selections::default()).unwrap_err();
        assert!(matches!(err, MappingError::EmptySelection { .. }));
    }

    #[test]
    fn test_selected_files_without_destination() {
        let err = build_plan(
            "selected_files:",
            "",
            &selections(&["a.txt"], &[]),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            MappingError::MissingSelectionDestination { .. }
        ));
    }

    #[test]
    fn test_selected_folders_expand() {
        let plan = build_plan(
            "selected_folders:/in/",
            "",
            &selections(&[], &["proj/f1", "proj/f2"]),
        )
        .unwrap();
        assert_eq!(
            plan.input_transfers,
            vec![
                MappingTask::DownloadPrefix {
                    prefix: "proj/f1".to_string(),
                    destination: "/in/".to_string(),
                },
                MappingTask::DownloadPrefix {
                    prefix: "proj/f2".to_string(),
                    destination: "/in/".to_string(),
                },
            ]
        );
    }

    #[test]
    fn test_empty_expression_is_empty_plan() {
        let plan = build_plan("", "", &Selections::default()).unwrap();
        assert!(plan.is_empty());
    }
}
