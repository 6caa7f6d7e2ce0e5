//! Shared, version-pinned artifact identifiers.
//!
//! These constants are the single source of truth for the `schema_version`
//! strings written into every machine-readable file under the governance
//! state directory. Bump the suffix whenever an artifact's shape changes.

pub const ARCHGATE_REGISTRY_SCHEMA_VERSION: &str = "archgate.registry@0.1.0";
pub const ARCHGATE_REPORT_SCHEMA_VERSION: &str = "archgate.report@0.1.0";
pub const ARCHGATE_RESULTS_SCHEMA_VERSION: &str = "archgate.results@0.1.0";
pub const ARCHGATE_CERTIFICATE_SCHEMA_VERSION: &str = "archgate.certificate@0.1.0";
pub const ARCHGATE_HINTS_SCHEMA_VERSION: &str = "archgate.hints@0.1.0";
pub const ARCHGATE_ROUTING_TABLE_SCHEMA_VERSION: &str = "archgate.routing-table@0.1.0";

pub const ARCHGATE_FIX_PLAN_SCHEMA_VERSION: &str = "archgate.fix.plan@0.1.0";
pub const ARCHGATE_FIX_APPLY_SCHEMA_VERSION: &str = "archgate.fix.apply@0.1.0";

pub const ARCHGATE_INGEST_STATE_SCHEMA_VERSION: &str = "archgate.ingest.state@0.1.0";
pub const ARCHGATE_AUDIT_ENTRY_SCHEMA_VERSION: &str = "archgate.audit.entry@0.1.0";
pub const ARCHGATE_ROLLBACK_ENTRY_SCHEMA_VERSION: &str = "archgate.rollback.entry@0.1.0";

pub const ARCHGATE_DOCTOR_REPORT_SCHEMA_VERSION: &str = "archgate.doctor.report@0.1.0";
pub const ARCHGATE_BRIDGE_SCHEMA_VERSION: &str = "archgate.bridge@0.1.0";

pub const SARIF_SCHEMA_URI: &str = "https://json.schemastore.org/sarif-2.1.0.json";
pub const SARIF_VERSION: &str = "2.1.0";
