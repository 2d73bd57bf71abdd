use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use ethers::types::Address;
use tempfile::NamedTempFile;
use tracing::{info, warn};

use crate::types::{AttackRecord, CompetitorProfile, ShieldError, ShieldResult};

/// 프로파일/공격 기록 영속 저장소
///
/// 프로파일은 경쟁자 id -> 필드 매핑 하나로, 공격 기록은
/// append-only JSON lines로 저장한다. 재기동 시 타임스탬프는
/// 프로세스 시작 기준이 아니라 절대값 그대로 복원된다
pub struct ProfileStore {
    dir: PathBuf,
}

impl ProfileStore {
    pub fn new(dir: impl AsRef<Path>) -> ShieldResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| ShieldError::Storage(e.to_string()))?;
        Ok(Self { dir })
    }

    fn profiles_path(&self) -> PathBuf {
        self.dir.join("profiles.json")
    }

    fn attacks_path(&self) -> PathBuf {
        self.dir.join("attacks.jsonl")
    }

    /// 프로파일 전체 저장 (임시 파일에 쓴 뒤 원자적 교체)
    pub fn save_profiles(
        &self,
        profiles: &HashMap<Address, CompetitorProfile>,
    ) -> ShieldResult<()> {
        let keyed: HashMap<String, &CompetitorProfile> = profiles
            .iter()
            .map(|(address, profile)| (format!("{:?}", address), profile))
            .collect();

        let encoded = serde_json::to_vec_pretty(&keyed)
            .map_err(|e| ShieldError::Storage(e.to_string()))?;

        let mut tmp = NamedTempFile::new_in(&self.dir)
            .map_err(|e| ShieldError::Storage(e.to_string()))?;
        tmp.write_all(&encoded)
            .map_err(|e| ShieldError::Storage(e.to_string()))?;
        tmp.persist(self.profiles_path())
            .map_err(|e| ShieldError::Storage(e.to_string()))?;

        info!("💾 프로파일 {}개 저장", profiles.len());
        Ok(())
    }

    pub fn load_profiles(&self) -> ShieldResult<HashMap<Address, CompetitorProfile>> {
        let path = self.profiles_path();
        if !path.exists() {
            return Ok(HashMap::new());
        }

        let raw = fs::read(&path).map_err(|e| ShieldError::Storage(e.to_string()))?;
        let keyed: HashMap<String, CompetitorProfile> =
            serde_json::from_slice(&raw).map_err(|e| ShieldError::Storage(e.to_string()))?;

        let mut profiles = HashMap::with_capacity(keyed.len());
        for (key, profile) in keyed {
            match key.parse::<Address>() {
                Ok(address) => {
                    profiles.insert(address, profile);
                }
                Err(_) => warn!("⚠️ 프로파일 키 파싱 실패, 건너뜀: {}", key),
            }
        }
        Ok(profiles)
    }

    /// 공격 기록 추가 (기존 기록은 절대 수정하지 않는다)
    pub fn append_attacks(&self, records: &[AttackRecord]) -> ShieldResult<()> {
        if records.is_empty() {
            return Ok(());
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.attacks_path())
            .map_err(|e| ShieldError::Storage(e.to_string()))?;

        for record in records {
            let line =
                serde_json::to_string(record).map_err(|e| ShieldError::Storage(e.to_string()))?;
            writeln!(file, "{}", line).map_err(|e| ShieldError::Storage(e.to_string()))?;
        }
        Ok(())
    }

    pub fn load_attacks(&self) -> ShieldResult<Vec<AttackRecord>> {
        let path = self.attacks_path();
        if !path.exists() {
            return Ok(Vec::new());
        }

        let file = fs::File::open(&path).map_err(|e| ShieldError::Storage(e.to_string()))?;
        let mut records = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.map_err(|e| ShieldError::Storage(e.to_string()))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<AttackRecord>(&line) {
                Ok(record) => records.push(record),
                Err(e) => warn!("⚠️ 공격 기록 파싱 실패, 건너뜀: {}", e),
            }
        }
        Ok(records)
    }
}
