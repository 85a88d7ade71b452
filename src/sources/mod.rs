pub mod directory;
pub mod event_log;

use snafu::Snafu;

/// Where a source starts when it has no usable bookmark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitialPosition {
    /// Beginning of stream: replay everything present.
    Bos,
    /// End of stream: only records arriving after start.
    Eos,
    /// Resume from the bookmark, falling back to the beginning.
    #[default]
    Bookmark,
    /// Skip records older than the configured instant.
    Timestamp,
}

#[derive(Debug, Snafu)]
pub enum SourceConfigError {
    #[snafu(display("source id must not be empty"))]
    EmptyId,

    #[snafu(display("at least one name filter is required"))]
    NoNameFilters,

    #[snafu(display("initial_position = timestamp requires initial_position_timestamp"))]
    MissingInitialTimestamp,

    #[snafu(display("unknown custom filter {name:?}"))]
    UnknownFilter { name: String },

    #[snafu(display("invalid parser configuration: {source}"))]
    Parser {
        source: logtap_parsers::ParserConfigError,
    },
}
