pub mod parse;
pub mod router;

pub use router::{build_router, AppState};
