pub use crate::config::{Config, ConfigBuilder};
pub use crate::error::{Error, Result};
pub use crate::executor::{
    once, once_after, repeating, CancelToken, Completion, PanicStrategy, Repeat, Task,
    TaskContext, TaskHandle, TaskId, TaskState,
};
pub use crate::scheduler::{Lifecycle, Scheduler, SchedulerInfo, SharedMutexRegistry};

pub use crate::telemetry::MetricsSnapshot;
