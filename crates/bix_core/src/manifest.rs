use crate::attribute::Attribute;
use crate::consts::{generation_dir_name, BASELINE_FILE};
use crate::errors::Result;
use crate::utils::fsync_dir;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use time::format_description::well_known::Rfc3339;

/// One published generation: its directory and the attributes it holds files for.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GenerationRec {
    pub number: u64,
    #[serde(with = "path_serde")]
    pub dir: PathBuf,
    pub attributes: Vec<Attribute>,
    /// Size of the universe (messages with at least one link).
    pub messages: u64,
    #[serde(default)]
    pub created: String,
}

mod path_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::path::PathBuf;

    pub fn serialize<S: Serializer>(p: &PathBuf, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&p.to_string_lossy())
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<PathBuf, D::Error> {
        let s = String::deserialize(d)?;
        Ok(PathBuf::from(s))
    }
}

/// `baseline.json`: which generation is current, and which ones are still on disk.
///
/// Replacing this file is the commit point of a writer batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub current: Option<u64>,
    #[serde(default)]
    pub generations: Vec<GenerationRec>,
}

impl Manifest {
    pub fn load(dir: &Path) -> Result<Self> {
        let p = dir.join(BASELINE_FILE);
        if !p.exists() {
            return Ok(Self::default());
        }
        let s = fs::read_to_string(p)?;
        let m: Manifest = serde_json::from_str(&s)?;
        Ok(m)
    }

    /// An error means the previous manifest is still the one on disk.
    pub fn save_atomic(&self, dir: &Path, sync: bool) -> Result<()> {
        self.commit(dir, sync, fsync_dir)
    }

    fn commit(&self, dir: &Path, sync: bool, sync_dir: impl FnOnce(&Path) -> io::Result<()>) -> Result<()> {
        let p = dir.join(BASELINE_FILE);
        let tmp = dir.join(format!("{BASELINE_FILE}.tmp"));
        let mut f = fs::File::create(&tmp)?;
        f.write_all(serde_json::to_string_pretty(self)?.as_bytes())?;
        if sync { f.sync_all()?; }
        drop(f);
        fs::rename(&tmp, &p)?;
        // the rename is the commit; past it the new manifest is live
        if sync {
            if let Err(e) = sync_dir(dir) {
                tracing::warn!(dir = %dir.display(), error = %e, "manifest committed but directory sync failed");
            }
        }
        Ok(())
    }

    pub fn current_rec(&self) -> Option<&GenerationRec> {
        let cur = self.current?;
        self.generations.iter().find(|g| g.number == cur)
    }

    pub fn next_number(&self) -> u64 {
        self.generations.iter().map(|g| g.number).max().unwrap_or(0) + 1
    }

    /// Record a new generation and make it current.
    pub fn publish(&mut self, number: u64, attributes: Vec<Attribute>, messages: u64) -> &GenerationRec {
        let created = time::OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default();
        self.generations.push(GenerationRec {
            number,
            dir: PathBuf::from(generation_dir_name(number)),
            attributes,
            messages,
            created,
        });
        self.current = Some(number);
        &self.generations[self.generations.len() - 1]
    }

    /// Superseded generations, oldest first.
    pub fn superseded(&self) -> Vec<&GenerationRec> {
        let mut v: Vec<&GenerationRec> = self.generations.iter().filter(|g| Some(g.number) != self.current).collect();
        v.sort_by_key(|g| g.number);
        v
    }

    pub fn forget(&mut self, number: u64) {
        self.generations.retain(|g| g.number != number);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn publish_save_load() {
        let dir = tempdir().unwrap();
        let mut m = Manifest::load(dir.path()).unwrap();
        assert!(m.current_rec().is_none());
        assert_eq!(m.next_number(), 1);
        m.publish(1, vec![Attribute::author()], 2);
        m.publish(2, vec![Attribute::author(), Attribute::bout()], 3);
        m.save_atomic(dir.path(), false).unwrap();

        let back = Manifest::load(dir.path()).unwrap();
        assert_eq!(back.current, Some(2));
        let rec = back.current_rec().unwrap();
        assert_eq!(rec.dir, PathBuf::from("gen-00000002"));
        assert_eq!(rec.attributes.len(), 2);
        assert_eq!(back.superseded().iter().map(|g| g.number).collect::<Vec<_>>(), vec![1]);
        assert_eq!(back.next_number(), 3);
    }

    #[test]
    fn failed_dir_sync_after_rename_still_commits() {
        let dir = tempdir().unwrap();
        let mut m = Manifest::default();
        m.publish(1, vec![Attribute::author()], 1);
        m.save_atomic(dir.path(), false).unwrap();

        m.publish(2, vec![Attribute::author()], 2);
        let res = m.commit(dir.path(), true, |_| Err(io::Error::new(io::ErrorKind::Other, "sync refused")));
        assert!(res.is_ok());
        assert_eq!(Manifest::load(dir.path()).unwrap().current, Some(2));
    }
}
