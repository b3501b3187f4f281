// Scoreboard CSV export for resolved groups.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::group::PredictionGroup;
use crate::scoring::Resolution;

/// Write the ranking of a resolved group to `<dir>/<group>.csv`.
///
/// Columns: `rank,participant,error,completion`. An undefined error is
/// written as `N/A`. The file is written under a temporary name and renamed
/// into place, so readers never see a partial scoreboard. Names that could
/// escape `dir` are refused.
pub fn write_scoreboard(dir: &Path, group: &str, resolution: &Resolution) -> Result<PathBuf> {
    PredictionGroup::validate_name(group)?;
    fs::create_dir_all(dir)
        .with_context(|| format!("failed to create export directory {}", dir.display()))?;

    let target = dir.join(format!("{group}.csv"));
    let tmp = dir.join(format!(".{group}.csv.tmp"));

    {
        let mut writer = csv::Writer::from_path(&tmp)
            .with_context(|| format!("failed to create {}", tmp.display()))?;
        writer
            .write_record(["rank", "participant", "error", "completion"])
            .context("failed to write scoreboard header")?;
        for (idx, (participant, score)) in resolution.ranking().iter().enumerate() {
            let error = score
                .error
                .map_or_else(|| "N/A".to_string(), |e| format!("{e:.6}"));
            writer
                .write_record([
                    (idx + 1).to_string(),
                    participant.to_string(),
                    error,
                    format!("{:.4}", score.completion),
                ])
                .context("failed to write scoreboard row")?;
        }
        writer.flush().context("failed to flush scoreboard")?;
    }

    fs::rename(&tmp, &target)
        .with_context(|| format!("failed to move scoreboard into {}", target.display()))?;
    Ok(target)
}
