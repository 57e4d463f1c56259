use super::ArtifactFile;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct TrackedFile {
    path: PathBuf,
    last_size: Option<u64>,
    stable: bool,
}

/// Polls file sizes until each one is unchanged across two consecutive polls.
///
/// A child may exit while a writer it left behind is still flushing, and there
/// is no completion signal to wait on. The total wait is bounded by `max_wait`;
/// files still changing at that point are returned with `stable: false`. Files
/// that disappear while polling are dropped.
pub fn await_stable_sizes(
    paths: Vec<PathBuf>,
    poll_interval: Duration,
    max_wait: Duration,
) -> Vec<ArtifactFile> {
    let started = Instant::now();
    let mut tracked = paths
        .into_iter()
        .map(|path| TrackedFile {
            last_size: file_size(&path),
            path,
            stable: false,
        })
        .collect::<Vec<_>>();

    while tracked.iter().any(|file| !file.stable) {
        let remaining = max_wait.saturating_sub(started.elapsed());
        // A shortened final window could mistake a pause for completion.
        if remaining < poll_interval {
            break;
        }
        thread::sleep(poll_interval);

        for file in tracked.iter_mut().filter(|file| !file.stable) {
            let size = file_size(&file.path);
            if size.is_some() && size == file.last_size {
                file.stable = true;
            } else {
                file.last_size = size;
            }
        }
    }

    tracked
        .into_iter()
        .filter_map(|file| {
            file.last_size.map(|size_bytes| ArtifactFile {
                path: file.path,
                size_bytes,
                stable: file.stable,
            })
        })
        .collect()
}

fn file_size(path: &Path) -> Option<u64> {
    fs::metadata(path).ok().map(|metadata| metadata.len())
}
