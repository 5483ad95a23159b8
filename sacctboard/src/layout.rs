// On-disk layout, rooted at the shared scoreboard directory:
//
//   clusters/<cluster>/state/{lock, poll_cursor.json, seen/<YYYY-MM>.bloom}
//   clusters/<cluster>/agg/rollups/monthly/<YYYY-MM>.json
//   clusters/<cluster>/agg/users/<username>.json
//   leaderboards/<window>_<metric>.json
//
// Each cluster subtree has a single writer (the holder of the state lock);
// leaderboards are whole-file rewrites and may be regenerated by any tick.

use sacctlog::Month;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub fn clusters_dir(root: &Path) -> PathBuf {
    root.join("clusters")
}

pub fn cluster_dir(root: &Path, cluster: &str) -> PathBuf {
    clusters_dir(root).join(cluster)
}

pub fn state_dir(root: &Path, cluster: &str) -> PathBuf {
    cluster_dir(root, cluster).join("state")
}

pub fn seen_dir(root: &Path, cluster: &str) -> PathBuf {
    state_dir(root, cluster).join("seen")
}

pub fn seen_path(root: &Path, cluster: &str, month: Month) -> PathBuf {
    seen_dir(root, cluster).join(format!("{month}.bloom"))
}

pub fn monthly_dir(root: &Path, cluster: &str) -> PathBuf {
    cluster_dir(root, cluster).join("agg").join("rollups").join("monthly")
}

pub fn monthly_path(root: &Path, cluster: &str, month: Month) -> PathBuf {
    monthly_dir(root, cluster).join(format!("{month}.json"))
}

pub fn users_dir(root: &Path, cluster: &str) -> PathBuf {
    cluster_dir(root, cluster).join("agg").join("users")
}

pub fn user_path(root: &Path, cluster: &str, user: &str) -> PathBuf {
    users_dir(root, cluster).join(format!("{user}.json"))
}

pub fn leaderboards_dir(root: &Path) -> PathBuf {
    root.join("leaderboards")
}

pub fn ensure_cluster_dirs(root: &Path, cluster: &str) -> io::Result<()> {
    fs::create_dir_all(monthly_dir(root, cluster))?;
    fs::create_dir_all(users_dir(root, cluster))?;
    fs::create_dir_all(seen_dir(root, cluster))?;
    Ok(())
}
