use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotKind {
    /// Live code captured right before a deploy
    Backup,
    /// The code a deploy put live
    Release,
    /// Live code captured right before a rollback
    Prerollback,
}

impl SnapshotKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotKind::Backup => "backup",
            SnapshotKind::Release => "release",
            SnapshotKind::Prerollback => "prerollback",
        }
    }
}

impl FromStr for SnapshotKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "backup" => Ok(SnapshotKind::Backup),
            "release" => Ok(SnapshotKind::Release),
            "prerollback" => Ok(SnapshotKind::Prerollback),
            other => Err(format!("unknown snapshot kind: {}", other)),
        }
    }
}

/// File name of an immutable snapshot: `{seq:06}-{kind}-{uuid}.py`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotRef(String);

impl SnapshotRef {
    pub(crate) fn new(seq: u64, kind: SnapshotKind) -> Self {
        SnapshotRef(format!("{:06}-{}-{}.py", seq, kind.as_str(), uuid::Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn seq(&self) -> Option<u64> {
        self.parts().map(|(seq, _)| seq)
    }

    pub fn kind(&self) -> Option<SnapshotKind> {
        self.parts().map(|(_, kind)| kind)
    }

    fn parts(&self) -> Option<(u64, SnapshotKind)> {
        let stem = self.0.strip_suffix(".py")?;
        let mut pieces = stem.splitn(3, '-');
        let seq = pieces.next()?.parse().ok()?;
        let kind = pieces.next()?.parse().ok()?;
        pieces.next()?;
        Some((seq, kind))
    }
}

impl FromStr for SnapshotRef {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let candidate = SnapshotRef(s.trim().to_string());
        if candidate.parts().is_none() || candidate.0.contains(['/', '\\']) {
            return Err(format!("not a snapshot name: {}", s));
        }
        Ok(candidate)
    }
}

impl fmt::Display for SnapshotRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
