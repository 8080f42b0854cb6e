//! `opflow` core: the declarative data model of providers and service
//! requests, placeholder templating, and effective-configuration merging.

pub mod clock;
pub mod context;
pub mod effective;
pub mod model;
pub mod template;
pub mod traits;
pub mod types;

pub use clock::{ClockSource, FixedClock, SystemClock};
pub use context::{Caller, QueryContext};
pub use effective::{EffectiveServiceRequest, InheritanceError};
pub use model::{
    ChainLink, ConfigPair, InheritanceOverrides, ParentLink, Provider, ResponseKey, Service,
    ServiceRequest, SrConfigItem, SrParameter, SrRateLimit, SrSchedule,
};
pub use template::{ReservedValues, Resolution, TemplateResolver};
pub use traits::ConfigSource;
pub use types::{
    Action, AuthType, ContentType, HttpMethod, PaginationType, ProviderId, ReturnDataType,
    ScheduleInterval, ServiceId, SrId, SrType, TypeParseError, WireFormat,
};
