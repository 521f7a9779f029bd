/// Errors from deriving the readout structure of a command stack.
#[derive(Debug, thiserror::Error)]
pub enum ReadoutError {
    /// A module program contains more than one block producing command.
    #[error("multiple block reads in readout of module '{module}'")]
    MultipleBlockReads { module: String },

    /// A block producing command appears after suffix words started.
    #[error("block read inside the suffix part of module '{module}'")]
    BlockReadInSuffix { module: String },

    /// Prefix or suffix word count does not fit the 8-bit part length.
    #[error("{part} of module '{module}' exceeds 255 words")]
    PartTooLong { module: String, part: &'static str },

    /// The event index does not map to a readout stack number.
    #[error("event index {index} out of range (max {max})")]
    StackIndexOutOfRange { index: usize, max: usize },

    /// Part sizes of a module do not add up to its data, or a module
    /// without a dynamic part claims dynamic words.
    #[error("module {module}: part sizes do not match its data")]
    InconsistentModuleData { module: usize },
}

pub type Result<T> = std::result::Result<T, ReadoutError>;

/// Internal failures of a single parse step.
///
/// These never leave the crate: the buffer entry points map them to
/// [`crate::ParseResult`] values.
#[derive(Debug, thiserror::Error)]
pub(crate) enum ParserError {
    /// Input ended in the middle of a structure that must be complete.
    #[error("end of buffer: {0}")]
    EndOfBuffer(String),

    /// A word was taken from a frame that has none left.
    #[error("end of frame")]
    EndOfFrame,

    #[error("module data without an event in progress")]
    NoEventInProgress,
}
