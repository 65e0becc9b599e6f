//! Provider routing: model resolution, provider state, and dispatch.

pub mod dispatch;
pub mod model;
pub mod providers;

pub use dispatch::{Dispatcher, RouterSettings};
pub use model::{parse_model_id, ModelRef};
pub use providers::{ProviderHandle, ProviderRegistry};
