//! Pre-defined pipeline stages.

pub mod batch;
pub mod database;
pub mod importers;
pub mod misc;
pub mod sources;
pub mod unload;

pub use batch::{BatchLimit, FileBatchStage, StreamBatchStage};
pub use database::{
    CreateTableStage, DropTableStage, PostImportHackStage, SourceComparisonStage,
    TruncateTableStage,
};
pub use importers::{FileImportStage, FileOutputStage, SkipImportStage, StreamImportStage};
pub use misc::{
    DelayStage, PrefixTableStage, PromptInputStage, RetryHandler, RetryStage, SemaphoreStage,
    SkipTableStage, SkipUntilStage, When,
};
pub use sources::{
    FilterColumnsStage, FilteredSource, JumbleConfig, JumbleDataStage, JumbledSource,
    LimitImportStage, LimitedSource,
};
pub use unload::{PipeDelimitedDecoder, SliceDecoder, UnloadGenerationStage, UnloadRetrievalStage};
