pub mod batch;
pub mod browser;
pub mod config;
pub mod context;
pub mod driver;
mod element;
pub mod error;
pub mod fields;
pub mod filler;
pub mod llm;
pub mod locator;
pub mod mapping;
pub mod page;
pub mod result;
pub mod session;
pub mod state;
pub mod store;
pub mod submit;

pub use batch::{run_batch, BatchSummary};
pub use browser::{PageOpener, PilotBrowser};
pub use config::{BrowserConfig, PilotConfig};
pub use context::RunContext;
pub use driver::{FormPage, FrameContext, Target};
pub use error::{Error, Result};
pub use page::Page;
pub use session::{run_session, SessionServices};
