use crate::deck::*;

#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct DeckCandidate {
    pub id: String,
    pub name: String,
    pub category: Category,
    #[serde(default)]
    pub ward: String,
    pub excluded: Option<bool>,
}

#[derive(PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct DeckConfig {
    #[serde(rename = "deckName")]
    pub deck_name: Option<String>,
    pub candidates: Vec<DeckCandidate>,
    /// Relative to the directory of the config file.
    #[serde(rename = "votesFile")]
    pub votes_file: Option<String>,
    #[serde(default)]
    pub settings: EngineSettings,
}

pub fn read_config(path: &Path) -> DeckResult<DeckConfig> {
    let display = path.display().to_string();
    let contents = fs::read_to_string(path).context(OpeningJsonSnafu {
        path: display.clone(),
    })?;
    let config: DeckConfig =
        serde_json::from_str(contents.as_str()).context(ParsingJsonSnafu { path: display })?;
    Ok(config)
}

pub fn read_votes(path: &Path) -> DeckResult<Vec<SnapshotRow>> {
    let display = path.display().to_string();
    info!("Attempting to read votes file {:?}", display);
    let contents = fs::read_to_string(path).context(OpeningJsonSnafu {
        path: display.clone(),
    })?;
    let rows: Vec<SnapshotRow> =
        serde_json::from_str(contents.as_str()).context(ParsingJsonSnafu { path: display })?;
    debug!("read_votes: {} rows", rows.len());
    Ok(rows)
}

pub fn build_registry(config: &DeckConfig) -> DeckResult<CandidateRegistry> {
    let mut builder = Builder::new();
    for c in config.candidates.iter() {
        builder = builder.add(Candidate {
            id: CandidateId::new(c.id.trim()),
            name: c.name.clone(),
            category: c.category,
            ward: c.ward.clone(),
            excluded: c.excluded.unwrap_or(false),
        });
    }
    builder.build().context(EngineSnafu {})
}
