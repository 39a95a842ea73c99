/*!
 * Prelude module for devgate core.
 *
 * Re-exports the types and functions every driver and bus needs.
 */

// Re-export error types
pub use crate::error::{Error, Result};

// Re-export data model
pub use crate::types::{
    find_device_resource, from_properties, Command, DeviceConfig, DeviceProfile, DeviceResource, DriverConfig,
    MessageBusConfig, Properties, ReadWrite, ResourceProperties,
    TelemetryResult, TypedValue, ValueType,
};

// Re-export coercion
pub use crate::coercion::{coerce, coerce_value};

// Re-export utility functions
pub use crate::utils::{with_retry, with_timeout, RetryPolicy};

// Re-export logging macros
pub use tracing::{debug, error, info, trace, warn};
