//! Message topic constants.
//!
//! These are the stable in-process wire contract between the shell and
//! plugins; the strings must not change.

// Plugin → publish pipeline
pub const PUBLISH_REGISTER: &str = "publish:register";
pub const PUBLISH_QUEUE: &str = "publish:queue";
pub const PUBLISH_DIRECT: &str = "publish:direct";
pub const PUBLISH_REMOVE: &str = "publish:remove";
pub const PUBLISH_REORDER: &str = "publish:reorder";
pub const PUBLISH_LIST: &str = "publish:list";
pub const PUBLISH_REPORT_SUCCESS: &str = "publish:report:success";
pub const PUBLISH_REPORT_FAILURE: &str = "publish:report:failure";

// Publish pipeline → plugins
pub const PUBLISH_EXECUTE: &str = "publish:execute";
pub const PUBLISH_QUEUED: &str = "publish:queued";
pub const PUBLISH_COMPLETED: &str = "publish:completed";
pub const PUBLISH_FAILED: &str = "publish:failed";
pub const PUBLISH_LIST_RESPONSE: &str = "publish:list:response";

// System
pub const SYSTEM_PLUGINS_READY: &str = "system:plugins:ready";
pub const SYNC_INITIAL_COMPLETED: &str = "sync:initial:completed";

// Job lifecycle
pub const JOB_STARTED: &str = "job:started";
pub const JOB_PROGRESS: &str = "job:progress";
pub const JOB_COMPLETED: &str = "job:completed";
pub const JOB_FAILED: &str = "job:failed";

// Batch lifecycle
pub const BATCH_PROGRESS: &str = "batch:progress";
pub const BATCH_COMPLETED: &str = "batch:completed";
pub const BATCH_FAILED: &str = "batch:failed";

// Entity lifecycle (emitted by entity storage, consumed by plugins)
pub const ENTITY_CREATED: &str = "entity:created";
pub const ENTITY_UPDATED: &str = "entity:updated";
pub const ENTITY_DELETED: &str = "entity:deleted";
