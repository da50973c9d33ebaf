pub mod aggregator;
pub mod histogram;
pub mod scheduler;
pub mod virtual_user;

pub use aggregator::{
    merge_shard_summaries, Aggregator, FinalSummary, LabelSummary, RealtimeRow, RequestEvent, ShardSummary,
};
pub use scheduler::{Scheduler, SchedulerState};
pub use virtual_user::{VirtualUser, VirtualUserConfig};
