//! Deterministic release identity.
//!
//! A release is named after its app, the minute its build was produced, and
//! a short digest of the descriptor and configuration it was cut from. The
//! same inputs always give the same name, so re-running a reconcile never
//! creates a duplicate and any material change yields a new release.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};

use flotilla_state::*;

use crate::error::RolloutResult;

/// Hex digits of the release digest kept in the name.
const NAME_DIGEST_LEN: usize = 5;

/// Descriptor fields that shape the running container. Scale, ingress and
/// deploy mode change how a release is run, not what it is.
#[derive(Serialize)]
struct FingerprintView<'a> {
    app: &'a str,
    target: &'a str,
    build: &'a str,
    runtime: &'a RuntimeSpec,
    configs: &'a [String],
}

fn sha256_hex(data: impl AsRef<[u8]>) -> String {
    hex::encode(Sha256::digest(data))
}

/// Digest of the container-shaping part of a descriptor.
pub fn target_fingerprint(spec: &AppTargetSpec) -> RolloutResult<String> {
    let view = FingerprintView {
        app: &spec.app,
        target: &spec.target,
        build: &spec.build,
        runtime: &spec.runtime,
        configs: &spec.configs,
    };
    Ok(sha256_hex(serde_json::to_vec(&view)?))
}

/// Digest combining the descriptor fingerprint with the config hash.
pub fn release_fingerprint(target_hash: &str, config_hash: Option<&str>) -> String {
    match config_hash {
        Some(config_hash) => sha256_hex(format!("{target_hash}-{config_hash}")),
        None => sha256_hex(target_hash),
    }
}

/// `{app}-{YYYYMMDD-HHMM}-{fingerprint[..5]}`, with the timestamp in UTC.
pub fn release_name(app: &str, build_created_at: u64, fingerprint: &str) -> String {
    let created = DateTime::<Utc>::from_timestamp(build_created_at as i64, 0).unwrap_or_default();
    let digest = fingerprint.get(..NAME_DIGEST_LEN).unwrap_or(fingerprint);
    format!("{app}-{}-{digest}", created.format("%Y%m%d-%H%M"))
}

/// Recency order: releases not yet persisted first, then by creation time,
/// newest first, with the name as a tie-breaker.
pub fn newest_first(a: &AppRelease, b: &AppRelease) -> Ordering {
    a.meta
        .is_persisted()
        .cmp(&b.meta.is_persisted())
        .then_with(|| b.meta.created_at.cmp(&a.meta.created_at))
        .then_with(|| b.meta.name.cmp(&a.meta.name))
}

pub fn sort_newest_first(releases: &mut [AppRelease]) {
    releases.sort_by(newest_first);
}
