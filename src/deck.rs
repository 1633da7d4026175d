use log::{debug, info, warn};

use live_tally::builder::{Builder, CandidateRegistry};
use live_tally::memory::MemoryBallotBox;
use live_tally::*;
use snafu::{prelude::*, Snafu};

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use serde_json::Value as JSValue;

use crate::deck::config_reader::*;

pub mod config_reader;

/// How long a cast vote may take to come back through the subscription.
const ECHO_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Snafu)]
pub enum DeckError {
    #[snafu(display("Error opening file {path}"))]
    OpeningJson {
        source: std::io::Error,
        path: String,
    },
    #[snafu(display("Error parsing file {path}"))]
    ParsingJson {
        source: serde_json::Error,
        path: String,
    },
    #[snafu(display("Error writing the leaderboards"))]
    WritingJson { source: serde_json::Error },
    #[snafu(display("Error writing file {path}"))]
    WritingFile {
        source: std::io::Error,
        path: String,
    },
    #[snafu(display("The config file has no parent directory"))]
    MissingParentDir {},
    #[snafu(display("Invalid vote {value:?}, expected candidate:category"))]
    InvalidCast { value: String },
    #[snafu(display("Invalid category: {message}"))]
    InvalidCategory { message: String },
    #[snafu(display("Tally error"))]
    Engine { source: TallyErrors },
}

pub type DeckResult<T> = Result<T, DeckError>;

/// Parses `candidate:category`.
fn parse_cast(value: &str) -> DeckResult<(CandidateId, Category)> {
    let (candidate, category) = value.rsplit_once(':').context(InvalidCastSnafu { value })?;
    ensure!(!candidate.trim().is_empty(), InvalidCastSnafu { value });
    let category = parse_category(category)?;
    Ok((CandidateId::new(candidate.trim()), category))
}

fn parse_category(value: &str) -> DeckResult<Category> {
    value
        .parse::<Category>()
        .map_err(|message| DeckError::InvalidCategory { message })
}

fn entry_to_json(entry: &LeaderboardEntry) -> JSValue {
    json!({
        "position": entry.position,
        "candidate": entry.candidate,
        "name": entry.name,
        "count": entry.count,
        "marker": entry.marker.map(|m| m.symbol()),
        "highlighted": entry.highlighted,
    })
}

fn build_summary_js(
    config: &DeckConfig,
    engine: &TallyEngine,
    categories: &[Category],
    rejected: Vec<JSValue>,
) -> JSValue {
    let leaderboards: Vec<JSValue> = categories
        .iter()
        .map(|category| {
            let entries: Vec<JSValue> = engine
                .leaderboard(*category)
                .iter()
                .map(entry_to_json)
                .collect();
            json!({"category": category.as_str(), "entries": entries})
        })
        .collect();
    json!({
        "deck": config.deck_name,
        "status": engine.status(),
        "lastVoted": engine.last_voted(),
        "notice": engine.notice(),
        "rejected": rejected,
        "leaderboards": leaderboards,
    })
}

/// Loads the deck, casts the given votes and returns the leaderboards.
pub async fn tally_deck(
    config_path: &str,
    votes_path: Option<&str>,
    casts: &[String],
    category: Option<&str>,
) -> DeckResult<JSValue> {
    let config_p = Path::new(config_path);
    let config = read_config(config_p)?;
    info!("config: {:?}", config);

    // Bad command line input is reported before anything starts.
    let casts: Vec<(CandidateId, Category)> = casts
        .iter()
        .map(|c| parse_cast(c))
        .collect::<DeckResult<_>>()?;
    let categories: Vec<Category> = match category {
        Some(c) => vec![parse_category(c)?],
        None => Category::ALL.to_vec(),
    };

    let registry = build_registry(&config)?;
    let rows = match (votes_path, &config.votes_file) {
        (Some(p), _) => read_votes(Path::new(p))?,
        (None, Some(f)) => {
            let root_p = config_p.parent().context(MissingParentDirSnafu {})?;
            read_votes(&root_p.join(f))?
        }
        (None, None) => vec![],
    };

    let ballot_box = Arc::new(MemoryBallotBox::new(rows));
    let engine = TallyEngine::start(
        registry,
        ballot_box.clone(),
        ballot_box.clone(),
        ballot_box,
        config.settings.clone(),
    );
    let status = engine.wait_until_settled().await.context(EngineSnafu {})?;
    info!("tally_deck: engine settled: {:?}", status);

    let mut rejected: Vec<JSValue> = Vec::new();
    for (candidate, category) in casts {
        match engine.submit(&candidate, category).await {
            Ok(event_id) => {
                match tokio::time::timeout(ECHO_TIMEOUT, engine.wait_for_event(&event_id)).await {
                    Ok(res) => res.context(EngineSnafu {})?,
                    Err(_) => warn!("tally_deck: vote {} was not counted in time", event_id),
                }
            }
            Err(e) if e.is_validation() => {
                warn!("tally_deck: {}", e);
                rejected.push(json!({
                    "candidate": candidate,
                    "category": category.as_str(),
                    "reason": e.to_string(),
                }));
            }
            Err(e) => {
                engine.shutdown().await;
                return Err(e).context(EngineSnafu {});
            }
        }
    }
    debug!("tally_deck: counts {:?}", engine.counts());

    let result_js = build_summary_js(&config, &engine, &categories, rejected);
    engine.shutdown().await;
    Ok(result_js)
}

pub async fn run_deck(
    config_path: &str,
    votes_path: Option<&str>,
    casts: &[String],
    category: Option<&str>,
    out_path: Option<&str>,
) -> DeckResult<()> {
    let result_js = tally_deck(config_path, votes_path, casts, category).await?;
    let pretty_js = serde_json::to_string_pretty(&result_js).context(WritingJsonSnafu {})?;
    match out_path {
        None | Some("stdout") => println!("{}", pretty_js),
        Some(p) => {
            info!("Writing leaderboards to {:?}", p);
            fs::write(p, pretty_js).context(WritingFileSnafu { path: p })?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const DECK: &str = r#"{
        "deckName": "Taupō 2025",
        "candidates": [
            {"id": "dave", "name": "Dave", "category": "mayor", "ward": "Mayor"},
            {"id": "john", "name": "John", "category": "mayor", "ward": "Mayor"},
            {"id": "kirsty", "name": "Kirsty", "category": "councillor", "ward": "Taupō East Rural"},
            {"id": "katrin", "name": "Katrin", "category": "councillor", "ward": "Taupō Ward", "excluded": true}
        ],
        "votesFile": "votes.json",
        "settings": {"notice_ttl_ms": 30000}
    }"#;

    const VOTES: &str = r#"[
        {"candidate_id": "john"},
        {"candidate_id": "john", "event_id": "row-2"},
        {"candidate_id": "dave", "event_id": "row-3", "created_at": "2025-09-01T10:00:00Z"},
        {"candidate_id": "katrin"},
        {"candidate_id": "nobody"}
    ]"#;

    fn write_deck(dir: &Path) -> String {
        let mut f = fs::File::create(dir.join("deck.json")).unwrap();
        f.write_all(DECK.as_bytes()).unwrap();
        let mut f = fs::File::create(dir.join("votes.json")).unwrap();
        f.write_all(VOTES.as_bytes()).unwrap();
        dir.join("deck.json").display().to_string()
    }

    fn board<'a>(js: &'a JSValue, category: &str) -> &'a Vec<JSValue> {
        js["leaderboards"]
            .as_array()
            .unwrap()
            .iter()
            .find(|b| b["category"] == category)
            .unwrap()["entries"]
            .as_array()
            .unwrap()
    }

    #[test]
    fn parses_casts() {
        assert_eq!(
            parse_cast("dave:mayor").unwrap(),
            (CandidateId::new("dave"), Category::Mayor)
        );
        assert_eq!(
            parse_cast(" kirsty : Councillor").unwrap(),
            (CandidateId::new("kirsty"), Category::Councillor)
        );
        assert!(parse_cast("dave").is_err());
        assert!(parse_cast(":mayor").is_err());
        assert!(parse_cast("dave:senator").is_err());
    }

    #[tokio::test]
    async fn tallies_the_stored_votes() {
        let dir = tempfile::tempdir().unwrap();
        let config = write_deck(dir.path());
        let js = tally_deck(&config, None, &[], None).await.unwrap();

        let mayors = board(&js, "mayor");
        assert_eq!(mayors.len(), 2);
        assert_eq!(mayors[0]["candidate"], "john");
        assert_eq!(mayors[0]["count"], 2);
        assert_eq!(mayors[0]["marker"], "👑");
        assert_eq!(mayors[1]["candidate"], "dave");
        assert_eq!(mayors[1]["marker"], "🥈");
        // Withdrawn and vote-less candidates are not shown.
        assert!(board(&js, "councillor").is_empty());
        assert_eq!(js["status"]["sync"], "Synced");
        assert_eq!(js["deck"], "Taupō 2025");
    }

    #[tokio::test]
    async fn casts_are_counted_once_and_highlighted() {
        let dir = tempfile::tempdir().unwrap();
        let config = write_deck(dir.path());
        let casts = vec![
            "dave:mayor".to_string(),
            "dave:mayor".to_string(),
            "kirsty:councillor".to_string(),
            "katrin:councillor".to_string(),
            "dave:councillor".to_string(),
        ];
        let js = tally_deck(&config, None, &casts, None).await.unwrap();

        let mayors = board(&js, "mayor");
        assert_eq!(mayors[0]["candidate"], "dave");
        assert_eq!(mayors[0]["count"], 3);
        assert_eq!(mayors[0]["highlighted"], false);
        let councillors = board(&js, "councillor");
        assert_eq!(councillors.len(), 1);
        assert_eq!(councillors[0]["count"], 1);
        assert_eq!(councillors[0]["highlighted"], true);
        assert_eq!(js["lastVoted"], "kirsty");
        assert_eq!(js["rejected"].as_array().unwrap().len(), 2);
        assert_eq!(js["notice"]["text"], "Vote saved!");
    }

    #[tokio::test]
    async fn votes_flag_overrides_the_config_and_category_filters() {
        let dir = tempfile::tempdir().unwrap();
        let config = write_deck(dir.path());
        let other = dir.path().join("other.json");
        fs::write(&other, r#"[{"candidate_id": "kirsty"}]"#).unwrap();
        let js = tally_deck(
            &config,
            Some(other.to_str().unwrap()),
            &[],
            Some("councillor"),
        )
        .await
        .unwrap();
        let boards = js["leaderboards"].as_array().unwrap();
        assert_eq!(boards.len(), 1);
        assert_eq!(board(&js, "councillor")[0]["candidate"], "kirsty");
    }

    #[tokio::test]
    async fn reports_bad_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.json").display().to_string();
        let res = tally_deck(&missing, None, &[], None).await;
        assert!(matches!(res, Err(DeckError::OpeningJson { .. })));

        let config = write_deck(dir.path());
        let res = tally_deck(&config, None, &["nope".to_string()], None).await;
        assert!(matches!(res, Err(DeckError::InvalidCast { .. })));

        let dup = dir.path().join("dup.json");
        fs::write(
            &dup,
            r#"{"candidates": [
                {"id": "a", "name": "A", "category": "mayor"},
                {"id": "a", "name": "A", "category": "mayor"}
            ]}"#,
        )
        .unwrap();
        let res = tally_deck(dup.to_str().unwrap(), None, &[], None).await;
        assert!(matches!(res, Err(DeckError::Engine { .. })));
    }

    #[tokio::test]
    async fn writes_the_output_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = write_deck(dir.path());
        let out = dir.path().join("out.json");
        run_deck(&config, None, &[], None, out.to_str())
            .await
            .unwrap();
        let js: JSValue = serde_json::from_str(&fs::read_to_string(&out).unwrap()).unwrap();
        assert_eq!(board(&js, "mayor").len(), 2);
    }
}
