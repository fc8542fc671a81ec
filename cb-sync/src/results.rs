// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{Context, Result};
use log::info;
use std::fs;

use super::context::{remove_if_exists, SyncServiceContext};
use cb_intf::SyncResult;
use cb_util::*;

/// Gather the per-client results stored by the final round, in the order
/// they were submitted, and remove the temporary files.
pub fn collect_results(ctx: &SyncServiceContext, nr_results: u32) -> Result<SyncResult> {
    let mut worker_results = Vec::with_capacity(nr_results as usize);
    for remaining in (1..=nr_results).rev() {
        let path = ctx.round_result_path(remaining);
        let body =
            fs::read_to_string(&path).with_context(|| format!("failed to read {:?}", &path))?;
        let result: serde_json::Value = serde_json::from_str(&body)
            .with_context(|| format!("failed to parse {:?}", &path))?;
        worker_results.push(result);
        remove_if_exists(&path)?;
    }

    Ok(SyncResult {
        controller_timing: ctx.controller_timing,
        worker_results,
    })
}

/// Publish the results for the controller and wait for it to pick them up.
pub fn hand_off_results(ctx: &SyncServiceContext, result: SyncResult) -> Result<()> {
    let nr_results = result.worker_results.len();
    JsonReportFile::new(&ctx.sync_file, result).commit()?;
    info!(
        "sync: {} results written to {:?}, waiting for pickup",
        nr_results, &ctx.sync_file
    );
    wait_for_removal(&ctx.sync_file, ctx.poll_interval);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{collect_results, hand_off_results};
    use crate::context::test_context;
    use cb_intf::SyncResult;
    use cb_util::*;
    use cb_util::json_file::staging_path;
    use std::fs;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_collect_and_hand_off() {
        let _ = ::env_logger::try_init();
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path(), 2);

        fs::write(ctx.round_result_path(2), "{\"pod\": \"first\"}").unwrap();
        fs::write(ctx.round_result_path(1), "{\"pod\": \"second\"}").unwrap();
        let result = collect_results(&ctx, 2).unwrap();
        assert_eq!(result.worker_results.len(), 2);
        assert_eq!(result.worker_results[0]["pod"], "first");
        assert_eq!(result.worker_results[1]["pod"], "second");
        assert!(!ctx.round_result_path(2).exists());
        assert!(!ctx.round_result_path(1).exists());

        let sync_file = ctx.sync_file.clone();
        let jh = thread::spawn(move || hand_off_results(&ctx, result));

        wait_for_file(&sync_file, 0.01);
        let loaded = SyncResult::load(&sync_file).unwrap();
        assert_eq!(loaded.worker_results.len(), 2);
        assert!(!staging_path(&sync_file).exists());

        thread::sleep(Duration::from_millis(50));
        assert!(!jh.is_finished());
        fs::remove_file(&sync_file).unwrap();
        jh.join().unwrap().unwrap();
    }

    #[test]
    fn test_missing_result_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path(), 2);
        fs::write(ctx.round_result_path(2), "{}").unwrap();
        assert!(collect_results(&ctx, 2).is_err());
    }
}
