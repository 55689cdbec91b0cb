pub mod artifacts;
pub mod cancel;
pub mod config;
pub mod locator;
pub mod memory;
pub mod oracle;
pub mod refine;
pub mod screen;
pub mod search;

pub use cancel::CancelToken;
pub use config::{MemoryConfig, OracleConfig, RetryPolicy, SearchConfig, SearchMode};
pub use locator::{LocateOutcome, LocateSource, Locator};
pub use memory::{LocationMemory, RememberRequest};
pub use oracle::{Oracle, OracleClient, Target};
pub use screen::{FileScreen, ScreenSource, StaticScreen};
pub use search::{Located, SearchEngine, SearchReport};
