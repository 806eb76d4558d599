//! The operations a command line front end exposes.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::process::Command;
use std::sync::Arc;
use std::time::Instant;

use camino::{Utf8Path, Utf8PathBuf};
use console::style;
use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::core::{Digest, HashAlgo};
use crate::dispatch::{
    CollectOptions, SchedulerApi, ShardResult, TaskRequest, TaskState, TriggeredShard,
};
use crate::error::{IsolateError, ManifestError, MappingError};
use crate::isolated::{FileEntry, Isolated, IsolatedBuild};
use crate::manifest::{ConfigValue, load_manifest_file};
use crate::storage::{FetchQueue, LocalCache, Storage, StorageApi};
use crate::threading::PRIORITY_MED;
use crate::utils::as_overhead;

/// What to resolve and how.
#[derive(Debug, Clone, Default)]
pub struct CheckOptions {
    pub manifest: Utf8PathBuf,
    /// Values for the manifest's configuration variables.
    pub config_variables: BTreeMap<String, ConfigValue>,
    /// Substitutions for `<(NAME)` in file entries.
    pub path_variables: BTreeMap<String, String>,
    /// Where to write the `.isolated` file, if anywhere.
    pub output: Option<Utf8PathBuf>,
}

/// Resolves the manifest for one configuration and hashes its inputs.
pub fn check(options: &CheckOptions, algo: HashAlgo) -> Result<IsolatedBuild, IsolateError> {
    let start = Instant::now();

    let configs = load_manifest_file(&options.manifest)?;
    let resolved = configs.resolve_for_config(&options.config_variables)?;
    let build = Isolated::build(&resolved, &options.path_variables, algo)?;

    if let Some(output) = &options.output {
        if let Some(parent) = output.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(output, build.isolated.to_json()?)?;
    }

    tracing::info!(
        "Resolved {} into {} files {}",
        options.manifest,
        build.isolated.files.len(),
        as_overhead(start)
    );

    Ok(build)
}

/// [`check`], then uploads the inputs and the `.isolated` file. Returns the
/// digest of the `.isolated` file.
pub fn archive<A: StorageApi>(
    options: &CheckOptions,
    storage: &Storage<A>,
) -> Result<Digest, IsolateError> {
    let build = check(options, storage.namespace().algo())?;
    let digest = storage.upload_tree(&build)?;

    eprintln!(
        "Archived {} as {}",
        style(&options.manifest).cyan(),
        style(&digest).yellow()
    );

    Ok(digest)
}

/// Downloads the `.isolated` file `digest` and every file it lists into
/// `outdir`.
pub fn remap<A: StorageApi, C: LocalCache>(
    storage: &Storage<A>,
    cache: C,
    digest: &Digest,
    outdir: &Utf8Path,
) -> Result<Isolated, IsolateError> {
    let isolated = Isolated::from_json(&storage.fetch(digest, None)?)?;
    if isolated.hash_algo()? != storage.namespace().algo() {
        return Err(ManifestError::Algorithm(isolated.algo).into());
    }

    fs::create_dir_all(outdir)?;

    let mut queue = FetchQueue::new(storage, cache);
    let mut targets: HashMap<&Digest, Vec<(&str, &FileEntry)>> = HashMap::new();

    for (path, entry) in &isolated.files {
        if let Some(link) = &entry.l {
            make_symlink(link, &outdir.join(path))?;
            continue;
        }

        let Some(digest) = &entry.h else {
            continue;
        };

        queue.add(digest, entry.s, PRIORITY_MED)?;
        targets.entry(digest).or_default().push((path.as_str(), entry));
    }

    let span = tracing::span!(Level::INFO, "remap");
    span.pb_set_length(targets.len() as u64);
    span.pb_set_style(&crate::utils::get_style_progress());
    span.pb_set_message("Fetching...");
    let _enter = span.enter();

    let mut remaining: HashSet<Digest> = targets.keys().map(|digest| (*digest).clone()).collect();

    while !remaining.is_empty() {
        let digest = queue.wait(&remaining)?;
        remaining.remove(&digest);
        span.pb_inc(1);

        let content = queue.cache().read(&digest)?;
        for (path, entry) in targets.get(&digest).into_iter().flatten() {
            let dest = outdir.join(path);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&dest, &content)?;
            set_mode(&dest, entry.m)?;
        }
    }

    tracing::info!("Mapped {} files into {outdir}", isolated.files.len());
    Ok(isolated)
}

/// Maps `digest` into a temporary directory and runs its command there.
/// Returns the command's exit code.
pub fn run<A: StorageApi, C: LocalCache>(
    storage: &Storage<A>,
    cache: C,
    digest: &Digest,
    extra_args: &[String],
) -> Result<i32, IsolateError> {
    let dir = tempfile::Builder::new().prefix("isoshard-run").tempdir()?;
    let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).map_err(MappingError::from)?;

    let isolated = remap(storage, cache, digest, &root)?;
    let Some((program, args)) = isolated.command.split_first() else {
        return Err(IsolateError::NoCommand);
    };

    let cwd = match &isolated.relative_cwd {
        Some(relative) => root.join(relative),
        None => root.clone(),
    };

    // Relative programs are looked up from the working directory.
    let program = if program.contains('/') && !Utf8Path::new(program).is_absolute() {
        cwd.join(program).into_string()
    } else {
        program.clone()
    };

    tracing::info!("Running {:?} in {cwd}", isolated.command);

    let status = Command::new(&program)
        .args(args)
        .args(extra_args)
        .current_dir(&cwd)
        .status()
        .map_err(|source| IsolateError::Spawn {
            command: isolated.command.clone(),
            source,
        })?;

    Ok(status.code().unwrap_or(1))
}

/// Triggers `shards` shards of `request` and lists where to watch them.
pub fn trigger<S: SchedulerApi + ?Sized>(
    api: &S,
    request: &TaskRequest,
    shards: usize,
) -> Result<Vec<TriggeredShard>, IsolateError> {
    let triggered = crate::dispatch::trigger_shards(api, request, shards)?;

    for shard in &triggered {
        eprintln!(
            "Triggered shard {} as {}: {}",
            shard.shard_index,
            style(&shard.task_id).yellow(),
            style(&shard.view_url).cyan()
        );
    }

    Ok(triggered)
}

/// Collects every shard, printing outputs as they arrive. Returns the exit
/// code for the whole run, which is non-zero when any shard failed or never
/// reported back.
pub fn collect<S: SchedulerApi>(
    api: Arc<S>,
    shards: &[TriggeredShard],
    options: &CollectOptions,
) -> Result<i64, IsolateError> {
    let summary = crate::dispatch::collect_with(api, shards, options, print_result)?;

    let failed = summary
        .results
        .iter()
        .filter(|result| result.exit_code.is_some_and(|code| code != 0))
        .count();

    eprintln!(
        "{} {} passed, {} failed, {} missing",
        style("Summary:").bold(),
        style(summary.results.len() - failed).green(),
        style(failed).red(),
        style(summary.missing.len()).yellow()
    );

    if summary.exit_code == 0 && !summary.missing.is_empty() {
        return Ok(1);
    }
    Ok(summary.exit_code)
}

fn print_result(result: &ShardResult) {
    let state = match (result.state, result.exit_code) {
        (TaskState::Completed, Some(0) | None) => style("ok").green(),
        (TaskState::TimedOut, _) => style("timed out").red(),
        _ => style("failed").red(),
    };

    eprintln!(
        "Shard {} {} ({}, {:.1}s)",
        result.shard_index,
        state,
        result.task_id,
        result.duration.unwrap_or_default()
    );

    if let Some(output) = &result.output {
        print!("{output}");
    }
}

#[cfg(unix)]
fn set_mode(path: &Utf8Path, mode: Option<u32>) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    match mode {
        Some(mode) => fs::set_permissions(path, fs::Permissions::from_mode(mode)),
        None => Ok(()),
    }
}

#[cfg(not(unix))]
fn set_mode(path: &Utf8Path, mode: Option<u32>) -> std::io::Result<()> {
    if mode.is_some_and(|mode| mode & 0o200 == 0) {
        let mut permissions = fs::metadata(path)?.permissions();
        permissions.set_readonly(true);
        fs::set_permissions(path, permissions)?;
    }
    Ok(())
}

fn make_symlink(target: &str, path: &Utf8Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    #[cfg(unix)]
    return std::os::unix::fs::symlink(target, path);

    #[cfg(not(unix))]
    {
        tracing::warn!("Skipping symlink {path} -> {target}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::core::Namespace;
    use crate::dispatch::{PollPolicy, Swarming, TaskProperties};
    use crate::net::fake::{FakeServer, FakeTask};
    use crate::storage::{Content, IsolateServer, Item, MemoryCache};

    type FakeStorage = Storage<IsolateServer<Arc<FakeServer>>>;

    fn storage(fake: &Arc<FakeServer>) -> FakeStorage {
        let api = IsolateServer::new("https://isolate.test", Namespace::new("default-gzip"), fake.clone());
        Storage::new(api, 4, 1).unwrap()
    }

    fn utf8(path: &std::path::Path) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(path.to_path_buf()).unwrap()
    }

    /// A manifest with two inputs, one in a subdirectory.
    fn project(command: &str) -> (tempfile::TempDir, CheckOptions) {
        let dir = tempfile::tempdir().unwrap();
        let root = utf8(dir.path());

        fs::create_dir_all(root.join("data")).unwrap();
        fs::write(root.join("main.txt"), "main input").unwrap();
        fs::write(root.join("data/extra.txt"), "extra input").unwrap();
        fs::write(
            root.join("target.isolate"),
            format!(
                "# Test target.\n{{\n  'variables': {{\n    'command': {command},\n    'files': ['main.txt', 'data/'],\n  }},\n}}\n"
            ),
        )
        .unwrap();

        let options = CheckOptions {
            manifest: root.join("target.isolate"),
            ..CheckOptions::default()
        };
        (dir, options)
    }

    #[test]
    fn test_check_writes_isolated() {
        let (dir, mut options) = project("['cat', 'main.txt']");
        let output = utf8(dir.path()).join("out/target.isolated");
        options.output = Some(output.clone());

        let build = check(&options, HashAlgo::Sha1).unwrap();

        let written = Isolated::from_json(&fs::read(&output).unwrap()).unwrap();
        assert_eq!(written, build.isolated);
        assert_eq!(written.command, vec!["cat", "main.txt"]);

        let keys: Vec<&str> = written.files.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["data/extra.txt", "main.txt"]);
    }

    #[test]
    fn test_archive_then_remap() {
        let (_dir, options) = project("['cat', 'main.txt']");
        let fake = FakeServer::new();
        let storage = storage(&fake);

        let digest = archive(&options, &storage).unwrap();

        let out = tempfile::tempdir().unwrap();
        let outdir = utf8(out.path()).join("mapped");
        let isolated = remap(&storage, MemoryCache::new(), &digest, &outdir).unwrap();

        assert_eq!(isolated.files.len(), 2);
        assert_eq!(fs::read_to_string(outdir.join("main.txt")).unwrap(), "main input");
        assert_eq!(
            fs::read_to_string(outdir.join("data/extra.txt")).unwrap(),
            "extra input"
        );

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(outdir.join("main.txt")).unwrap().permissions().mode();
            assert_eq!(mode & 0o200, 0, "read-only inputs lose the write bit");
        }
    }

    #[test]
    fn test_remap_refuses_paths_outside_outdir() {
        let fake = FakeServer::new();
        let storage = storage(&fake);

        let content = b"escaped".to_vec();
        let file = storage.namespace().digest(&content);
        let isolated = serde_json::json!({
            "algo": "sha-1",
            "version": crate::isolated::ISOLATED_VERSION,
            "files": {"../escaped.txt": {"h": file.to_string(), "s": content.len()}},
        })
        .to_string()
        .into_bytes();
        let digest = storage.namespace().digest(&isolated);

        storage
            .upload_items(vec![
                (Item::new(file, content.len() as u64), Content::from(content)),
                (Item::new(digest.clone(), isolated.len() as u64), Content::from(isolated)),
            ])
            .unwrap();

        let base = tempfile::tempdir().unwrap();
        let outdir = utf8(base.path()).join("out");
        let err = remap(&storage, MemoryCache::new(), &digest, &outdir).unwrap_err();

        assert!(matches!(err, IsolateError::Manifest(ManifestError::UnsafePath(_))));
        assert!(!utf8(base.path()).join("escaped.txt").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_run_returns_exit_code() {
        let (_dir, options) = project("['sh', '-c', 'test -f data/extra.txt && exit 3']");
        let fake = FakeServer::new();
        let storage = storage(&fake);

        let digest = archive(&options, &storage).unwrap();
        assert_eq!(run(&storage, MemoryCache::new(), &digest, &[]).unwrap(), 3);
    }

    #[test]
    fn test_run_without_command() {
        let dir = tempfile::tempdir().unwrap();
        let root = utf8(dir.path());
        fs::write(root.join("a.txt"), "a").unwrap();
        fs::write(root.join("t.isolate"), "{'variables': {'files': ['a.txt']}}").unwrap();

        let fake = FakeServer::new();
        let storage = storage(&fake);
        let options = CheckOptions {
            manifest: root.join("t.isolate"),
            ..CheckOptions::default()
        };

        let digest = archive(&options, &storage).unwrap();
        assert!(matches!(
            run(&storage, MemoryCache::new(), &digest, &[]),
            Err(IsolateError::NoCommand)
        ));
    }

    #[test]
    fn test_collect_missing_shard_fails_the_run() {
        let fake = FakeServer::new();
        fake.script_shard(1, FakeTask::new(&["RUNNING"], None, ""));
        let api = Arc::new(Swarming::new("https://swarm.test", fake.clone()));

        let request = TaskRequest::new("unit_tests", TaskProperties::default());
        let shards = trigger(&*api, &request, 2).unwrap();

        let options = CollectOptions {
            timeout: Duration::from_millis(200),
            poll: PollPolicy {
                initial: Duration::from_millis(5),
                max: Duration::from_millis(20),
                ramp: 30.0,
            },
            deadlock_timeout: None,
            ..CollectOptions::default()
        };

        assert_eq!(collect(api, &shards, &options).unwrap(), 1);
    }
}
