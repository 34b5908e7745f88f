//! Category to queue routing. Versioned; queue names are part of the
//! persisted task records, so a rename needs a new version.

use hostplane_core::TaskCategory;

pub const ROUTING_VERSION: u32 = 1;

pub fn queue_for(category: TaskCategory) -> &'static str {
    match category {
        TaskCategory::Provisioning => "provisioning",
        TaskCategory::LifecycleOperation => "lifecycle-operations",
        TaskCategory::Maintenance => "maintenance",
        TaskCategory::Monitoring => "monitoring",
        TaskCategory::Migration => "migration",
    }
}

/// Every route, in category order.
pub fn routing_table() -> Vec<(TaskCategory, &'static str)> {
    TaskCategory::all()
        .iter()
        .map(|c| (*c, queue_for(*c)))
        .collect()
}
