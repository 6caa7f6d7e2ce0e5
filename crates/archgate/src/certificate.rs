use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use archgate_contracts::ARCHGATE_CERTIFICATE_SCHEMA_VERSION;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;

use crate::config::GovConfig;
use crate::error::CertificateError;
use crate::gate::{Verdict, VerifyPolicy};
use crate::report::{Counts, RuleResult, Status, Violation};
use crate::store::{self, StateDir};
use crate::util;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_METHOD: &str = "hmac-sha256";
pub const SIGNING_KEY_ENV: &str = "ARCHGATE_SIGNING_KEY";
pub const RULE_CERTIFICATE_SIGNATURE: &str = "0.2-certificate-signature";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Certificate {
    pub schema_version: String,
    pub issued_at: String,
    pub pass: bool,
    pub counts: Counts,
    pub policy: VerifyPolicy,
    pub message: String,
    #[serde(default)]
    pub reasons: Vec<String>,
    pub evidence_hashes: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature_method: Option<String>,
}

/// `ARCHGATE_SIGNING_KEY`, else the contents of `signing_key_file`
/// (relative to the workspace root), trimmed.
pub fn signing_key(root: &Path, cfg: &GovConfig) -> Option<Vec<u8>> {
    if let Ok(k) = std::env::var(SIGNING_KEY_ENV) {
        if !k.trim().is_empty() {
            return Some(k.trim().as_bytes().to_vec());
        }
    }
    let file = cfg.signing_key_file.as_ref()?;
    match std::fs::read_to_string(root.join(file)) {
        Ok(text) if !text.trim().is_empty() => Some(text.trim().as_bytes().to_vec()),
        Ok(_) => None,
        Err(err) => {
            tracing::warn!(file = %file, "signing key file unreadable: {err}");
            None
        }
    }
}

/// Evidence artifacts bound into the certificate, keyed by workspace path.
pub fn evidence_paths(state: &StateDir) -> Vec<std::path::PathBuf> {
    vec![state.sarif(), state.junit(), state.report(), state.results()]
}

pub fn evidence_hashes(state: &StateDir) -> Result<BTreeMap<String, String>> {
    let mut out = BTreeMap::new();
    for path in evidence_paths(state) {
        if !path.is_file() {
            continue;
        }
        let bytes = std::fs::read(&path).with_context(|| format!("read evidence: {}", path.display()))?;
        out.insert(state.rel(&path), util::sha256_hex(&bytes));
    }
    Ok(out)
}

/// Canonical bytes covered by the signature: the certificate without its
/// signature fields, keys sorted.
fn signed_payload(cert: &Certificate) -> Result<Vec<u8>> {
    let mut v = serde_json::to_value(cert)?;
    if let Value::Object(map) = &mut v {
        map.remove("signature");
        map.remove("signatureMethod");
    }
    util::canonical_json_bytes(&v)
}

fn mac(key: &[u8]) -> Result<HmacSha256> {
    HmacSha256::new_from_slice(key).map_err(|err| anyhow::anyhow!("hmac key: {err}"))
}

pub fn sign(cert: &mut Certificate, key: &[u8]) -> Result<()> {
    let mut m = mac(key)?;
    m.update(&signed_payload(cert)?);
    cert.signature = Some(STANDARD.encode(m.finalize().into_bytes()));
    cert.signature_method = Some(SIGNATURE_METHOD.to_string());
    Ok(())
}

pub fn verify_signature(cert: &Certificate, key: Option<&[u8]>) -> Result<(), CertificateError> {
    let key = key.ok_or(CertificateError::MissingKey)?;
    let sig = cert
        .signature
        .as_deref()
        .ok_or_else(|| CertificateError::Malformed("certificate is unsigned".to_string()))?;
    if cert.signature_method.as_deref() != Some(SIGNATURE_METHOD) {
        return Err(CertificateError::Malformed(format!(
            "unsupported signatureMethod {:?}",
            cert.signature_method
        )));
    }
    let expected = STANDARD
        .decode(sig)
        .map_err(|err| CertificateError::Malformed(format!("signature is not base64: {err}")))?;
    let payload = signed_payload(cert).map_err(|err| CertificateError::Malformed(format!("{err:#}")))?;
    let mut m = mac(key).map_err(|err| CertificateError::Malformed(format!("{err:#}")))?;
    m.update(&payload);
    m.verify_slice(&expected).map_err(|_| CertificateError::BadSignature)
}

/// `0.2-certificate-signature` as decided at issue time. Known before the
/// certificate is written, so the report it lands in can be hashed as
/// evidence.
pub fn signing_rule(state: &StateDir, signed: bool) -> RuleResult {
    let violations = if signed {
        Vec::new()
    } else {
        vec![Violation::new(
            RULE_CERTIFICATE_SIGNATURE,
            state.rel(&state.certificate()),
            1,
            CertificateError::MissingKey.to_string(),
            format!("Export {SIGNING_KEY_ENV} or set signing_key_file in config.yml."),
        )]
    };
    RuleResult::from_violations(
        RULE_CERTIFICATE_SIGNATURE,
        "Certificate is signed",
        Status::Fail,
        violations,
    )
}

/// Builds, signs (when a key is available) and writes `certificate.json`.
/// A missing key still writes the unsigned certificate; the returned rule
/// records the failure.
pub fn issue(
    state: &StateDir,
    verdict: &Verdict,
    policy: VerifyPolicy,
    key: Option<&[u8]>,
) -> Result<(Certificate, RuleResult)> {
    let mut cert = Certificate {
        schema_version: ARCHGATE_CERTIFICATE_SCHEMA_VERSION.to_string(),
        issued_at: store::now_rfc3339(),
        pass: verdict.pass,
        counts: verdict.counts,
        policy,
        message: verdict.message.clone(),
        reasons: verdict.reasons.clone(),
        evidence_hashes: evidence_hashes(state)?,
        signature: None,
        signature_method: None,
    };

    if let Some(k) = key {
        sign(&mut cert, k)?;
    } else {
        tracing::warn!("{}", CertificateError::MissingKey);
    }
    store::write_json_atomic(&state.certificate(), &cert)?;
    Ok((cert, signing_rule(state, key.is_some())))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvidenceCheck {
    pub path: String,
    pub expected: String,
    pub actual: Option<String>,
    pub ok: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateCheck {
    pub ok: bool,
    pub signature_ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature_error: Option<String>,
    pub evidence: Vec<EvidenceCheck>,
}

impl CertificateCheck {
    /// `0.2-certificate-signature` FAIL naming each mismatch, or `None` when
    /// the certificate still holds.
    pub fn failure_rule(&self, state: &StateDir) -> Option<RuleResult> {
        if self.ok {
            return None;
        }
        let cert_rel = state.rel(&state.certificate());
        let mut violations = Vec::new();
        if let Some(err) = &self.signature_error {
            violations.push(Violation::new(
                RULE_CERTIFICATE_SIGNATURE,
                cert_rel.clone(),
                1,
                format!("signature check failed: {err}"),
                "Re-run `archgate verify` with the signing key to issue a fresh certificate.",
            ));
        }
        for e in self.evidence.iter().filter(|e| !e.ok) {
            let found = e.actual.as_deref().unwrap_or("missing file");
            violations.push(Violation::new(
                RULE_CERTIFICATE_SIGNATURE,
                e.path.clone(),
                1,
                format!("evidence hash mismatch: certified {}, found {found}", e.expected),
                "Evidence changed after signing; restore it or re-run `archgate verify`.",
            ));
        }
        Some(RuleResult::from_violations(
            RULE_CERTIFICATE_SIGNATURE,
            "Certificate is signed",
            Status::Fail,
            violations,
        ))
    }
}

/// Re-verifies the signature and recomputes every evidence hash. Hash
/// comparison runs even when the signature check already failed.
pub fn check(state: &StateDir, key: Option<&[u8]>) -> Result<CertificateCheck> {
    let path = state.certificate();
    let bytes = std::fs::read(&path).with_context(|| format!("read certificate: {}", path.display()))?;
    let cert: Certificate = match serde_json::from_slice(&bytes) {
        Ok(c) => c,
        Err(err) => {
            return Ok(CertificateCheck {
                ok: false,
                signature_ok: false,
                signature_error: Some(CertificateError::Malformed(err.to_string()).to_string()),
                evidence: Vec::new(),
            })
        }
    };

    let signature_error = verify_signature(&cert, key).err().map(|e| e.to_string());
    let mut evidence = Vec::new();
    for (rel, expected) in &cert.evidence_hashes {
        let actual = std::fs::read(state.root.join(rel))
            .ok()
            .map(|b| util::sha256_hex(&b));
        evidence.push(EvidenceCheck {
            path: rel.clone(),
            expected: expected.clone(),
            ok: actual.as_deref() == Some(expected.as_str()),
            actual,
        });
    }
    let signature_ok = signature_error.is_none();
    Ok(CertificateCheck {
        ok: signature_ok && evidence.iter().all(|e| e.ok),
        signature_ok,
        signature_error,
        evidence,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &[u8] = b"test-signing-key";

    fn verdict() -> Verdict {
        crate::gate::evaluate(&VerifyPolicy::default(), Counts::default())
    }

    fn seeded_state() -> (tempfile::TempDir, StateDir) {
        let tmp = tempfile::tempdir().unwrap();
        let state = StateDir::new(tmp.path());
        store::write_atomic(&state.report(), b"{\"results\":[]}\n").unwrap();
        store::write_atomic(&state.sarif(), b"{\"version\":\"2.1.0\"}\n").unwrap();
        (tmp, state)
    }

    #[test]
    fn signed_certificate_round_trips() {
        let (_tmp, state) = seeded_state();
        let (cert, rule) = issue(&state, &verdict(), VerifyPolicy::default(), Some(KEY)).unwrap();
        assert_eq!(rule.status, Status::Pass);
        assert_eq!(cert.signature_method.as_deref(), Some(SIGNATURE_METHOD));
        assert_eq!(cert.evidence_hashes.len(), 2);

        let c = check(&state, Some(KEY)).unwrap();
        assert!(c.ok, "{c:?}");
        assert!(matches!(
            verify_signature(&cert, Some(b"other")),
            Err(CertificateError::BadSignature)
        ));
    }

    #[test]
    fn missing_key_writes_unsigned_certificate_and_fails_rule() {
        let (_tmp, state) = seeded_state();
        let (cert, rule) = issue(&state, &verdict(), VerifyPolicy::default(), None).unwrap();
        assert!(cert.signature.is_none());
        assert!(state.certificate().is_file());
        assert_eq!(rule.status, Status::Fail);
    }

    #[test]
    fn flipped_byte_fails_signature_and_reports_hash_mismatch() {
        let (_tmp, state) = seeded_state();
        let (cert, _) = issue(&state, &verdict(), VerifyPolicy::default(), Some(KEY)).unwrap();
        let report_rel = state.rel(&state.report());
        let hash = cert.evidence_hashes[&report_rel].clone();

        let mut bytes = std::fs::read(state.certificate()).unwrap();
        let text = String::from_utf8(bytes.clone()).unwrap();
        let at = text.find(&hash).unwrap();
        bytes[at] = if bytes[at] == b'0' { b'1' } else { b'0' };
        std::fs::write(state.certificate(), &bytes).unwrap();

        let c = check(&state, Some(KEY)).unwrap();
        assert!(!c.ok);
        assert!(!c.signature_ok);
        assert!(c.signature_error.as_deref().unwrap().contains("signature"));
        let mismatch: Vec<&EvidenceCheck> = c.evidence.iter().filter(|e| !e.ok).collect();
        assert_eq!(mismatch.len(), 1);
        assert_eq!(mismatch[0].path, report_rel);
        assert_eq!(mismatch[0].actual.as_deref(), Some(hash.as_str()));
    }

    #[test]
    fn tampered_evidence_is_reported_with_valid_signature() {
        let (_tmp, state) = seeded_state();
        issue(&state, &verdict(), VerifyPolicy::default(), Some(KEY)).unwrap();
        std::fs::write(state.sarif(), b"{}").unwrap();
        let c = check(&state, Some(KEY)).unwrap();
        assert!(c.signature_ok);
        assert!(!c.ok);
        assert_eq!(c.evidence.iter().filter(|e| !e.ok).count(), 1);

        let rule = c.failure_rule(&state).expect("mismatch yields a rule");
        assert_eq!(rule.rule_id, RULE_CERTIFICATE_SIGNATURE);
        assert_eq!(rule.status, Status::Fail);
        assert_eq!(rule.violations.len(), 1);
        assert_eq!(rule.violations[0].file, state.rel(&state.sarif()));
        assert!(rule.violations[0].message.contains("evidence hash mismatch"));
    }

    #[test]
    fn intact_certificate_yields_no_failure_rule() {
        let (_tmp, state) = seeded_state();
        issue(&state, &verdict(), VerifyPolicy::default(), Some(KEY)).unwrap();
        let c = check(&state, Some(KEY)).unwrap();
        assert!(c.failure_rule(&state).is_none());
    }
}
