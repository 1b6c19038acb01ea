pub(crate) mod arena;
pub(crate) mod header;
pub(crate) mod integration;
pub(crate) mod large;
pub(crate) mod loom_tests;
pub(crate) mod node_pool;
pub(crate) mod numa;
pub(crate) mod size_class;
pub(crate) mod stats;
pub(crate) mod topology;
pub(crate) mod vm;

#[cfg(test)]
crate::sync::sync_static! {
    pub static TEST_MUTEX: crate::sync::RwLock<()> = crate::sync::RwLock::new(());
}
