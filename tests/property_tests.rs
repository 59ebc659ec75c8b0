//! Property-based tests for unipack
//!
//! These tests use the `proptest` crate to generate random inputs and verify
//! that rule parsing, decision stores and call deduplication behave the same
//! across a wide range of inputs.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use proptest::prelude::*;
use unipack::recycler::{CallKey, TaskRecycler};
use unipack::{IgnoreRule, IgnoredUpdatesDatabase, MemoryStore, PackageFilter, PackageLoader};
use unipack::{LoaderKind, ManagerSource, Package};

fn date_strategy() -> impl Strategy<Value = NaiveDate> {
    (2000i32..2100, 1u32..=12, 1u32..=28)
        .prop_map(|(y, m, d)| NaiveDate::from_ymd_opt(y, m, d).unwrap())
}

proptest! {
    #[test]
    fn rule_text_round_trips(raw in "\\*|<[0-9]{4}-[0-9]{2}-[0-9]{2}|[0-9a-z.+-]{1,16}") {
        let rule: IgnoreRule = raw.parse().unwrap();
        let rendered = rule.to_string();
        let reparsed: IgnoreRule = rendered.parse().unwrap();
        prop_assert_eq!(rule, reparsed);
    }

    #[test]
    fn parsing_never_fails(raw in ".{0,40}") {
        let rule: std::result::Result<IgnoreRule, _> = raw.parse();
        prop_assert!(rule.is_ok());
    }

    #[test]
    fn date_rule_active_strictly_before_its_date(
        until in date_strategy(),
        today in date_strategy(),
        version in "[0-9.]{1,8}",
    ) {
        let db = IgnoredUpdatesDatabase::load(Arc::new(MemoryStore::new()));
        db.add("npm", "pkg", IgnoreRule::Until(until));
        let ignored = db.is_ignored_on("npm", "pkg", &version, today);
        prop_assert_eq!(ignored, today < until);
        // Expired rules are gone after the read that saw them expire.
        prop_assert_eq!(db.rules().is_empty(), today >= until);
    }

    #[test]
    fn exact_version_rule_matches_only_itself(
        ignored in "[0-9]{1,2}\\.[0-9]{1,2}",
        candidate in "[0-9]{1,2}\\.[0-9]{1,2}",
    ) {
        let db = IgnoredUpdatesDatabase::load(Arc::new(MemoryStore::new()));
        db.add("winget", "App.Id", IgnoreRule::Version(ignored.clone()));
        prop_assert_eq!(db.is_ignored("WINGET", "App.Id", &candidate), ignored == candidate);
    }

    #[test]
    fn loader_never_holds_duplicate_identities(
        ids in prop::collection::vec("[a-d]", 0..20),
    ) {
        let source = Arc::new(ManagerSource::new("main", "", "scoop"));
        let packages: Vec<Package> = ids
            .iter()
            .map(|id| Package::new(id, id, Arc::clone(&source)))
            .collect();
        let loader = PackageLoader::new(LoaderKind::Installed);
        loader.reconcile("scoop", &packages);

        let mut distinct = ids.clone();
        distinct.sort();
        distinct.dedup();
        let listed: Vec<String> = loader
            .get_packages(&PackageFilter::all())
            .into_iter()
            .map(|p| p.id)
            .collect();
        prop_assert_eq!(listed, distinct);
    }

    #[test]
    fn concurrent_callers_share_one_execution(callers in 1usize..16) {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        let (executions, shared) = runtime.block_on(async move {
            let recycler = Arc::new(TaskRecycler::<usize>::default());
            let executions = Arc::new(AtomicUsize::new(0));
            let calls = (0..callers).map(|_| {
                let recycler = Arc::clone(&recycler);
                let executions = Arc::clone(&executions);
                async move {
                    recycler
                        .run_or_attach(
                            CallKey::new("pip", "installed"),
                            Duration::from_secs(1),
                            move || async move {
                                executions.fetch_add(1, Ordering::SeqCst);
                                tokio::time::sleep(Duration::from_millis(20)).await;
                                Ok(7usize)
                            },
                        )
                        .await
                }
            });
            let results = futures::future::join_all(calls).await;
            let first = results[0].as_ref().unwrap().clone();
            let shared = results
                .iter()
                .all(|r| Arc::ptr_eq(r.as_ref().unwrap(), &first));
            (executions.load(Ordering::SeqCst), shared)
        });
        prop_assert_eq!(executions, 1);
        prop_assert!(shared);
    }
}
