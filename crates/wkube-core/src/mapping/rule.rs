//! Mapping rule parsing.
//!
//! Remote sources are written `acc://<prefix>`. Because the rule separator is
//! also `:`, the parser first substitutes `acc://` with the `__acc__` marker,
//! then requires exactly one `:` in what remains.

use std::fmt;

use super::MappingError;

/// Marker the `acc://` scheme is rewritten to before splitting.
const ACC_MARKER: &str = "__acc__";

/// Reserved mount root for pipe (symlink-shared) volumes.
pub(crate) const PIPE_MOUNT: &str = "/mnt/pipe";

/// Reserved mount root for graph (bulk-copy) volumes.
pub(crate) const GRAPH_MOUNT: &str = "/mnt/graph";

/// Source of an input mapping rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputSource {
    /// Prefix in the gateway's object store (`acc://…`).
    Remote(String),

    /// Path under the pipe mount, shared by symlink.
    MountedPipe(String),

    /// Path under the graph mount, shared by bulk copy.
    MountedGraph(String),

    /// Late-binding reference to the `selected_filenames` list.
    SelectedFiles,

    /// Late-binding reference to the `selected_foldernames` list.
    SelectedFolders,
}

/// Destination of an output mapping rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputTarget {
    /// Prefix in the gateway's object store.
    Remote(String),

    /// Path under the pipe mount.
    MountedPipe(String),

    /// Path under the graph mount.
    MountedGraph(String),
}

/// One parsed input rule. The destination is kept verbatim; defaulting and
/// absolute-path enforcement happen during plan construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputRule {
    /// Where the data comes from.
    pub source: InputSource,

    /// Local destination path, possibly empty before defaulting.
    pub destination: String,
}

/// One parsed output rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputRule {
    /// Absolute local source path.
    pub source: String,

    /// Where the data goes.
    pub destination: OutputTarget,
}

/// Parse one input rule. Blank rules (from trailing `;` separators) parse to
/// `None`.
///
/// # Errors
///
/// Returns [`MappingError::InvalidSyntax`] when the rule is not exactly
/// `<source>:<destination>`, and [`MappingError::InvalidInputSource`] for a
/// source outside the input vocabulary.
pub fn parse_input_rule(raw: &str) -> Result<Option<InputRule>, MappingError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }

    let (source, destination) = split_rule(raw)?;

    let source = if let Some(prefix) = source.strip_prefix(ACC_MARKER) {
        InputSource::Remote(prefix.to_string())
    } else if source.starts_with(PIPE_MOUNT) {
        InputSource::MountedPipe(source.to_string())
    } else if source.starts_with(GRAPH_MOUNT) {
        InputSource::MountedGraph(source.to_string())
    } else if source == "selected_files" {
        InputSource::SelectedFiles
    } else if source == "selected_folders" {
        InputSource::SelectedFolders
    } else {
        return Err(MappingError::InvalidInputSource {
            value: source.to_string(),
        });
    };

    Ok(Some(InputRule {
        source,
        destination: destination.to_string(),
    }))
}

/// Parse one output rule. Blank rules parse to `None`.
///
/// # Errors
///
/// Returns an error when the rule shape is wrong, the source is remote or
/// relative, or the destination is outside the output vocabulary.
pub fn parse_output_rule(raw: &str) -> Result<Option<OutputRule>, MappingError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }

    let (source, destination) = split_rule(raw)?;

    if source.starts_with(ACC_MARKER) {
        return Err(MappingError::InvalidOutputSource {
            value: source.to_string(),
        });
    }
    if !source.starts_with('/') {
        return Err(MappingError::RelativeOutputSource {
            value: source.to_string(),
        });
    }

    let destination = if let Some(prefix) = destination.strip_prefix(ACC_MARKER) {
        OutputTarget::Remote(prefix.to_string())
    } else if destination.starts_with(PIPE_MOUNT) {
        OutputTarget::MountedPipe(destination.to_string())
    } else if destination.starts_with(GRAPH_MOUNT) {
        OutputTarget::MountedGraph(destination.to_string())
    } else {
        return Err(MappingError::InvalidOutputTarget {
            target: destination.to_string(),
        });
    };

    Ok(Some(OutputRule {
        source: source.to_string(),
        destination,
    }))
}

/// Substitute the remote scheme, then split on the single remaining `:`.
fn split_rule(raw: &str) -> Result<(String, String), MappingError> {
    let substituted = raw.replacen("acc://", ACC_MARKER, 1);
    let parts: Vec<&str> = substituted.split(':').collect();
    if parts.len() != 2 {
        return Err(MappingError::InvalidSyntax {
            mapping: raw.to_string(),
        });
    }
    Ok((parts[0].to_string(), parts[1].to_string()))
}

impl fmt::Display for InputRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            InputSource::Remote(prefix) => write!(f, "acc://{prefix}:{}", self.destination),
            InputSource::MountedPipe(path) | InputSource::MountedGraph(path) => {
                write!(f, "{path}:{}", self.destination)
            },
            InputSource::SelectedFiles => write!(f, "selected_files:{}", self.destination),
            InputSource::SelectedFolders => write!(f, "selected_folders:{}", self.destination),
        }
    }
}

impl fmt::Display for OutputRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.destination {
            OutputTarget::Remote(prefix) => write!(f, "{}:acc://{prefix}", self.source),
            OutputTarget::MountedPipe(path) | OutputTarget::MountedGraph(path) => {
                write!(f, "{}:{path}", self.source)
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_remote_input() {
        let rule = parse_input_rule("acc://proj/in:/data/in/").unwrap().unwrap();
        assert_eq!(rule.source, InputSource::Remote("proj/in".to_string()));
        assert_eq!(rule.destination, "/data/in/");
    }

    #[test]
    fn test_parse_mounted_inputs() {
        let pipe = parse_input_rule("/mnt/pipe/shared/:/data/shared").unwrap().unwrap();
        assert_eq!(
            pipe.source,
            InputSource::MountedPipe("/mnt/pipe/shared/".to_string())
        );

        let graph = parse_input_rule("/mnt/graph/bulk:/data/bulk").unwrap().unwrap();
        assert_eq!(
            graph.source,
            InputSource::MountedGraph("/mnt/graph/bulk".to_string())
        );
    }

    #[test]
    fn test_parse_selection_inputs() {
        let files = parse_input_rule("selected_files:/in/").unwrap().unwrap();
        assert_eq!(files.source, InputSource::SelectedFiles);

        let folders = parse_input_rule("selected_folders:/in/").unwrap().unwrap();
        assert_eq!(folders.source, InputSource::SelectedFolders);
    }

    #[test]
    fn test_parse_blank_rule_is_none() {
        assert_eq!(parse_input_rule("  ").unwrap(), None);
        assert_eq!(parse_output_rule("").unwrap(), None);
    }

    #[test]
    fn test_parse_rejects_bad_shapes() {
        // No separator at all.
        assert!(matches!(
            parse_input_rule("justapath"),
            Err(MappingError::InvalidSyntax { .. })
        ));
        // Two separators survive substitution.
        assert!(matches!(
            parse_input_rule("acc://a:acc://b"),
            Err(MappingError::InvalidSyntax { .. })
        ));
    }

    #[test]
    fn test_parse_rejects_unknown_input_source() {
        assert!(matches!(
            parse_input_rule("/data/foo:/data/bar"),
            Err(MappingError::InvalidInputSource { .. })
        ));
    }

    #[test]
    fn test_parse_output_rejects_remote_source() {
        assert!(matches!(
            parse_output_rule("acc://proj/out:/mnt/pipe/x"),
            Err(MappingError::InvalidOutputSource { .. })
        ));
    }

    #[test]
    fn test_parse_output_rejects_relative_source() {
        assert!(matches!(
            parse_output_rule("data/out:acc://proj/out"),
            Err(MappingError::RelativeOutputSource { .. })
        ));
    }

    #[test]
    fn test_parse_output_rejects_plain_local_target() {
        assert!(matches!(
            parse_output_rule("/data/out:/data/elsewhere"),
            Err(MappingError::InvalidOutputTarget { .. })
        ));
    }

    #[test]
    fn test_parse_output_remote_target() {
        let rule = parse_output_rule("/data/out:acc://proj/out/").unwrap().unwrap();
        assert_eq!(rule.source, "/data/out");
        assert_eq!(
            rule.destination,
            OutputTarget::Remote("proj/out/".to_string())
        );
    }

    #[test]
    fn test_round_trip_is_identity_modulo_trim() {
        for raw in [
            "acc://proj/in:/data/in/",
            "/mnt/pipe/shared:/data/shared",
            "selected_files:/in/",
            "selected_folders:/in/",
        ] {
            let rule = parse_input_rule(&format!("  {raw} ")).unwrap().unwrap();
            assert_eq!(rule.to_string(), raw);
        }

        for raw in ["/data/out:acc://proj/out/", "/data/out:/mnt/graph/store"] {
            let rule = parse_output_rule(raw).unwrap().unwrap();
            assert_eq!(rule.to_string(), raw);
        }
    }
}
