use super::*;
use crate::model::{JobMode, Severity};
use crate::schema::{SanitizeTag, SchemaRegistry, SemanticType};

const DOCUMENT: &str = r#"
storage:
  type: sqlite
  path: /tmp/sync.db
sanitization:
  secret_env: COUNTY_SECRET
lookups:
  land_use:
    R1: Residential
    C2: Commercial
tables:
  - name: parcels
    source: pacs_property
    target: cama_parcel
    primary_key: [id]
    source_columns:
      - { name: id, type: int }
      - { name: owner, type: string }
      - { name: land_use_code, type: string }
      - { name: land_value, type: float }
      - { name: improvement_value, type: float }
      - { name: total_value, type: float }
      - { name: mtime, type: int }
      - { name: deleted, type: bool }
    columns:
      - { name: id, type: int, nullable: false }
      - { name: owner, type: string, sanitize: pii-name }
      - { name: land_use, type: string, expr: "lookup(land_use, land_use_code)" }
      - { name: land_value, type: float }
      - { name: improvement_value, type: float }
      - { name: total_value, type: float, zscore: true }
    last_modified: mtime
    deletes:
      strategy: soft_delete
      column: deleted
    classification: confidential
    rules:
      - id: value_sum
        expr: "land_value + improvement_value = total_value ± 1"
      - id: total_positive
        expr: "total_value >= 0"
        severity: critical
job:
  mode: full
  batch_size: 250
  validation_mode: strict
  tables:
    - name: parcels
      detection: timestamp
      conflict: merge
      merge:
        - { column: owner, take: target }
        - { column: total_value, take: combiner, combiner: max }
"#;

fn parse() -> EngineConfig {
    EngineConfig::from_yaml_str(DOCUMENT).unwrap()
}

// ============================================================================
// Parsing Tests
// ============================================================================

#[test]
fn test_default_config() {
    let config = EngineConfig::default();
    assert_eq!(config.storage.storage_type, StorageType::Memory);
    assert_eq!(config.sanitization.secret_env, SECRET_ENV_VAR);
    assert_eq!(config.job.batch_size, 1000);
    assert_eq!(config.job.max_parallel_tables, 2);
    assert_eq!(config.job.audit_retention_days, 30);
    assert_eq!(config.job.stat_window, 1000);
    assert_eq!(config.job.z_threshold, 3.0);
    assert_eq!(config.job.retry_ceiling, 5);
    assert_eq!(config.job.call_timeout_secs, 30);
    assert_eq!(config.job.lease_ttl_secs, 60);
    assert_eq!(config.job.heartbeat_interval(), std::time::Duration::from_secs(20));
    assert_eq!(config.job.batch_time_limit_secs, 30);
    assert_eq!(config.job.validation_mode, ValidationMode::Tolerant);
    assert_eq!(config.job.mode, JobMode::Incremental);
}

#[test]
fn test_parse_yaml() {
    let config = parse();
    assert_eq!(config.storage.storage_type, StorageType::Sqlite);
    assert_eq!(config.storage.path, "/tmp/sync.db");
    assert_eq!(config.sanitization.secret_env, "COUNTY_SECRET");
    assert_eq!(config.tables.len(), 1);

    let parcels = &config.tables[0];
    assert_eq!(parcels.source.as_deref(), Some("pacs_property"));
    assert_eq!(parcels.columns[1].sanitize, SanitizeTag::PiiName);
    assert_eq!(parcels.rules[0].severity, Severity::Error);
    assert_eq!(parcels.rules[1].severity, Severity::Critical);

    assert_eq!(config.job.mode, JobMode::Full);
    assert_eq!(config.job.batch_size, 250);
    assert_eq!(config.job.stat_window, 1000);
    assert_eq!(config.job.validation_mode, ValidationMode::Strict);
    let table = config.job.table("parcels");
    assert_eq!(table.conflict, ConflictStrategy::Merge);
    assert_eq!(table.merge[1].combiner.as_deref(), Some("max"));
}

#[test]
fn test_missing_delete_strategy_is_rejected() {
    let yaml = r#"
tables:
  - name: owners
    primary_key: [id]
    source_columns: [{ name: id, type: int }]
    columns: [{ name: id, type: int }]
"#;
    assert!(matches!(
        EngineConfig::from_yaml_str(yaml),
        Err(SyncError::Config(_))
    ));
}

#[test]
fn test_secret_is_redacted_in_debug() {
    let config = SanitizationConfig {
        secret_env: "UNUSED".into(),
        secret: Some("hunter2".into()),
    };
    let rendered = format!("{:?}", config);
    assert!(!rendered.contains("hunter2"));
    assert!(config.load_secret().is_some());
}

#[test]
fn test_load_from_explicit_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sync.yaml");
    std::fs::write(&path, DOCUMENT).unwrap();

    let config = EngineConfig::load(path.to_str()).unwrap();
    assert_eq!(config.tables[0].name, "parcels");
    assert_eq!(config.job.batch_size, 250);
}

// ============================================================================
// Job Validation Tests
// ============================================================================

fn registry(config: &EngineConfig) -> SchemaRegistry {
    SchemaRegistry::from_config(&config.tables, config.lookups.clone()).unwrap()
}

#[test]
fn test_job_validation_accepts_document() {
    let config = parse();
    let registry = registry(&config);
    config.job.validate(&registry).unwrap();
    assert_eq!(
        registry.get("parcels").unwrap().column("total_value").unwrap().semantic_type,
        SemanticType::Float
    );
}

#[test]
fn test_job_validation_rejects_bad_values() {
    let config = parse();
    let registry = registry(&config);

    let mut job = config.job.clone();
    job.batch_size = 0;
    assert!(job.validate(&registry).is_err());

    let mut job = config.job.clone();
    job.z_threshold = 0.0;
    assert!(job.validate(&registry).is_err());

    let mut job = config.job.clone();
    job.tables.push(TableJobConfig::named("levies"));
    assert!(job.validate(&registry).is_err());

    let mut job = config.job.clone();
    job.tables[0].merge.clear();
    assert!(job.validate(&registry).is_err());
}

#[test]
fn test_full_mode_forces_content_hash() {
    let config = parse();
    let registry = registry(&config);
    assert_eq!(
        config.job.detection_for("parcels", &registry),
        DetectionStrategy::ContentHash
    );

    let mut job = config.job.clone();
    job.mode = JobMode::Incremental;
    assert_eq!(
        job.detection_for("parcels", &registry),
        DetectionStrategy::Timestamp
    );
}
