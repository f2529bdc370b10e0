use std::sync::Arc;

use crate::domain::orchestrator::GpuMounter;
use crate::domain::reaper::PlaceholderReaper;
use crate::domain::reaper::ReaperHandle;
use crate::domain::reconcile::OrphanSweeper;

/// Everything the background tasks need. The reaper and the sweeper are
/// consumed when their tasks start.
pub struct ApplicationServices {
    pub mounter: Arc<GpuMounter>,
    pub reaper_handle: ReaperHandle,
    pub reaper: PlaceholderReaper,
    pub sweeper: OrphanSweeper,
}
