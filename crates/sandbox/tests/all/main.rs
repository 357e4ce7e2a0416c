mod fork;
mod guest_api;
mod hot_swap;
mod tenant;

use forkvm::{TenantConfig, TenantInstance};

pub(crate) fn config(name: &str) -> TenantConfig {
    let _ = env_logger::try_init();
    TenantConfig::new(name, "integration", "/nonexistent/program.elf")
        .with_max_instructions(200_000)
        .with_max_memory(16 << 20)
        .with_max_heap(1 << 20)
}

/// A tenant serving `binary`.
pub(crate) fn tenant(binary: Vec<u8>) -> TenantInstance {
    let tenant = TenantInstance::with_binary(config("integration"), binary);
    assert!(!tenant.no_program_loaded());
    tenant
}
