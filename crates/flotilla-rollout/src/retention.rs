//! Release retention.

use std::time::Duration;

use tracing::info;

use flotilla_state::*;

use crate::error::RolloutResult;

/// Releases that are always kept, counted newest first.
pub const RELEASES_TO_KEEP: usize = 10;
/// Anything younger than this is kept regardless of rank.
pub const RELEASE_MIN_AGE: Duration = Duration::from_secs(48 * 60 * 60);

/// Releases past the retention window. `releases` must already be sorted
/// newest first. A release holding the active or target role is never
/// expired.
pub fn expired_releases(releases: &[AppRelease], now: u64) -> Vec<&AppRelease> {
    releases
        .iter()
        .skip(RELEASES_TO_KEEP)
        .filter(|r| r.meta.is_persisted())
        .filter(|r| !matches!(r.spec.role, ReleaseRole::Active | ReleaseRole::Target))
        .filter(|r| now.saturating_sub(r.meta.created_at) >= RELEASE_MIN_AGE.as_secs())
        .collect()
}

/// Delete expired releases. Returns how many were removed; ones already
/// gone are not counted.
pub fn collect_garbage(store: &ObjectStore, releases: &[AppRelease], now: u64) -> RolloutResult<usize> {
    let mut deleted = 0;
    for release in expired_releases(releases, now) {
        if store.delete::<AppReleaseSpec>(&release.meta.namespace, &release.meta.name)? {
            info!(release = %release.name(), created_at = release.meta.created_at, "deleted old release");
            deleted += 1;
        }
    }
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::naming::sort_newest_first;

    const NOW: u64 = 1_700_000_000;
    const HOUR: u64 = 60 * 60;

    fn release(i: u64, created_at: u64) -> AppRelease {
        let mut meta = ObjectMeta::new("prod", &format!("web-{i:02}"));
        meta.created_at = created_at;
        Object::new(
            meta,
            AppReleaseSpec {
                app: "web".to_string(),
                target: "prod".to_string(),
                build: format!("build-{i}"),
                config: String::new(),
                num_desired: 0,
                role: ReleaseRole::None,
                traffic_percentage: 0,
                runtime: RuntimeSpec::default(),
            },
        )
    }

    fn persisted(store: &ObjectStore, releases: Vec<AppRelease>) -> Vec<AppRelease> {
        let mut out: Vec<AppRelease> = releases
            .into_iter()
            .map(|r| store.create(r).unwrap())
            .collect();
        sort_newest_first(&mut out);
        out
    }

    #[test]
    fn old_releases_beyond_rank_are_deleted() {
        let store = ObjectStore::open_in_memory().unwrap();
        // 12 releases, one hour apart, all older than three days.
        let releases = persisted(
            &store,
            (0..12).map(|i| release(i, NOW - 72 * HOUR + i * HOUR)).collect(),
        );

        let deleted = collect_garbage(&store, &releases, NOW).unwrap();

        assert_eq!(deleted, 2);
        let remaining = store.list::<AppReleaseSpec>().unwrap();
        assert_eq!(remaining.len(), 10);
        assert!(store.get::<AppReleaseSpec>("prod", "web-00").unwrap().is_none());
        assert!(store.get::<AppReleaseSpec>("prod", "web-01").unwrap().is_none());
        assert!(store.get::<AppReleaseSpec>("prod", "web-02").unwrap().is_some());
    }

    #[test]
    fn recent_releases_survive_regardless_of_rank() {
        let store = ObjectStore::open_in_memory().unwrap();
        let releases = persisted(
            &store,
            (0..15).map(|i| release(i, NOW - 47 * HOUR + i * 60)).collect(),
        );

        assert!(expired_releases(&releases, NOW).is_empty());
        assert_eq!(collect_garbage(&store, &releases, NOW).unwrap(), 0);
        assert_eq!(store.list::<AppReleaseSpec>().unwrap().len(), 15);
    }

    #[test]
    fn serving_release_is_never_expired() {
        let mut releases: Vec<AppRelease> = (0..12)
            .map(|i| {
                let mut r = release(i, NOW - 100 * HOUR - i);
                r.meta.spec_version = 1;
                r
            })
            .collect();
        releases[11].spec.role = ReleaseRole::Active;
        releases[11].spec.traffic_percentage = 100;

        let expired: Vec<&str> = expired_releases(&releases, NOW).iter().map(|r| r.name()).collect();
        assert_eq!(expired, vec!["web-10"]);
    }

    #[test]
    fn top_ranked_releases_are_kept_even_when_old() {
        let releases: Vec<AppRelease> = (0..10)
            .map(|i| {
                let mut r = release(i, NOW - 500 * HOUR);
                r.meta.spec_version = 1;
                r
            })
            .collect();
        assert!(expired_releases(&releases, NOW).is_empty());
    }
}
