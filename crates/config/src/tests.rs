use super::*;

#[test]
fn defaults_match_spec_option_table() {
    let cfg = EngineConfig::default();
    assert_eq!(cfg.page_size, 4096);
    assert!(cfg.sync_writes);
    assert_eq!(cfg.encryption_type, EncryptionType::None);
    assert!(cfg.encryption_key.is_none());
    assert_eq!(cfg.default_isolation_level, IsolationLevel::ReadCommitted);
    assert_eq!(cfg.lock_timeout_ms, 30_000);
}

#[test]
fn cache_budgets_grow_l1_to_l3() {
    let cfg = EngineConfig::default();
    assert!(cfg.l1_cache_size < cfg.l2_cache_size);
    assert!(cfg.l2_cache_size < cfg.l3_cache_size);
    assert!(cfg.l1_cache_memory < cfg.l2_cache_memory);
    assert!(cfg.l2_cache_memory < cfg.l3_cache_memory);
}
