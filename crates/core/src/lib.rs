//! Domain core for image-generation orchestration.
//!
//! Network-free building blocks shared by the backend layer:
//!
//! - [`capability`]: backend capability snapshot and the LoRA merge.
//! - [`request`]: generation request payload and [`RequestBuilder`].
//! - [`session`]: job lifecycle state and single-flight admission.
//! - [`progress`]: progress samples and the poller transition table.
//! - [`settings`]: configuration store contract and typed settings.

pub mod capability;
pub mod error;
pub mod progress;
pub mod request;
pub mod session;
pub mod settings;

pub use capability::{CapabilityKind, CapabilitySnapshot, LoraModifier};
pub use error::CoreError;
pub use progress::{PollConfig, ProgressSample};
pub use request::{GenerationRequest, HiresPass, RequestBuilder};
pub use session::{JobState, Session};
pub use settings::{BackendSource, GenerationSettings, SettingsStore};
