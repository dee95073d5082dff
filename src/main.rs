use std::path::PathBuf;

use anyhow::{anyhow, Result};
use dotenvy::dotenv;
use tracing::{error, info, warn};

use terrasense::config::CONFIG;
use terrasense::db::database::Database;
use terrasense::db::models::AnalysisInsert;
use terrasense::llm::types::CHAT_APOLOGY_REPLY;
use terrasense::utils::logging::init_logging;
use terrasense::{AnalysisResult, ChatMessage, ChatRole, ImageInput, SoilAnalyzer};

const DEFAULT_HISTORY_LIMIT: i64 = 50;
const RETRY_PROMPT: &str = "Não foi possível falar com o serviço de análise agora. Tente novamente em instantes.";

#[derive(Debug, PartialEq)]
enum Command {
    Analyze {
        image: PathBuf,
        location: Option<String>,
    },
    Ask {
        analysis_id: i64,
        question: String,
    },
    History {
        limit: i64,
        search: Option<String>,
    },
    Chat {
        analysis_id: i64,
    },
}

fn usage() -> &'static str {
    "Usage:\n  terrasense analyze --image <path> [--location <text>]\n  terrasense ask --analysis-id <id> --question <text>\n  terrasense history [--limit <n>] [--search <text>]\n  terrasense chat --analysis-id <id>"
}

fn next_value<'a>(args: &'a [String], index: &mut usize, flag: &str) -> Result<&'a str> {
    *index += 1;
    args.get(*index)
        .map(|value| value.as_str())
        .ok_or_else(|| anyhow!("Missing value for {flag}"))
}

fn parse_analysis_id(value: &str) -> Result<i64> {
    value
        .parse::<i64>()
        .map_err(|_| anyhow!("Invalid --analysis-id value: {value}"))
}

fn parse_command(args: &[String]) -> Result<Command> {
    let Some(name) = args.get(1).map(|value| value.as_str()) else {
        return Err(anyhow!(usage()));
    };

    let mut image: Option<PathBuf> = None;
    let mut location: Option<String> = None;
    let mut analysis_id: Option<i64> = None;
    let mut question: Option<String> = None;
    let mut limit = DEFAULT_HISTORY_LIMIT;
    let mut search: Option<String> = None;

    let mut index = 2;
    while index < args.len() {
        match args[index].as_str() {
            "--image" => {
                image = Some(PathBuf::from(next_value(args, &mut index, "--image")?));
            }
            "--location" => {
                let value = next_value(args, &mut index, "--location")?.trim();
                location = (!value.is_empty()).then(|| value.to_string());
            }
            "--analysis-id" => {
                analysis_id = Some(parse_analysis_id(next_value(
                    args,
                    &mut index,
                    "--analysis-id",
                )?)?);
            }
            "--question" => {
                question = Some(next_value(args, &mut index, "--question")?.to_string());
            }
            "--limit" => {
                let value = next_value(args, &mut index, "--limit")?;
                limit = value
                    .parse::<i64>()
                    .map_err(|_| anyhow!("Invalid --limit value: {value}"))?
                    .max(1);
            }
            "--search" => {
                let value = next_value(args, &mut index, "--search")?.trim();
                search = (!value.is_empty()).then(|| value.to_string());
            }
            "--help" | "-h" => return Err(anyhow!(usage())),
            other => {
                return Err(anyhow!("Unknown argument: {other}\n{}", usage()));
            }
        }
        index += 1;
    }

    match name {
        "analyze" => Ok(Command::Analyze {
            image: image.ok_or_else(|| anyhow!("--image is required"))?,
            location,
        }),
        "ask" => {
            let question = question
                .filter(|value| !value.trim().is_empty())
                .ok_or_else(|| anyhow!("--question is required"))?;
            Ok(Command::Ask {
                analysis_id: analysis_id.ok_or_else(|| anyhow!("--analysis-id is required"))?,
                question,
            })
        }
        "history" => Ok(Command::History { limit, search }),
        "chat" => Ok(Command::Chat {
            analysis_id: analysis_id.ok_or_else(|| anyhow!("--analysis-id is required"))?,
        }),
        other => Err(anyhow!("Unknown command: {other}\n{}", usage())),
    }
}

fn require_api_key() -> Result<()> {
    if CONFIG.gemini_api_key.is_empty() {
        return Err(anyhow!("GEMINI_API_KEY is required for this command"));
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let _guards = init_logging();

    let args: Vec<String> = std::env::args().collect();
    let command = parse_command(&args)?;
    let db = Database::init(&CONFIG.database_url).await?;

    match command {
        Command::Analyze { image, location } => run_analyze(&db, image, location).await,
        Command::Ask {
            analysis_id,
            question,
        } => run_ask(&db, analysis_id, &question).await,
        Command::History { limit, search } => {
            run_history(&db, limit, search.as_deref()).await
        }
        Command::Chat { analysis_id } => run_chat(&db, analysis_id).await,
    }
}

async fn run_analyze(db: &Database, image: PathBuf, location: Option<String>) -> Result<()> {
    require_api_key()?;
    let bytes = tokio::fs::read(&image)
        .await
        .map_err(|err| anyhow!("Failed to read image {}: {err}", image.display()))?;
    info!("Analyzing soil image {} ({} bytes)", image.display(), bytes.len());

    let analyzer = SoilAnalyzer::from_config(&CONFIG);
    let result = match analyzer.analyze_image(ImageInput::Bytes(bytes)).await {
        Ok(result) => result,
        Err(err) => {
            error!("Soil analysis failed: {}", err);
            return Err(anyhow!("{RETRY_PROMPT} ({err})"));
        }
    };

    if result == AnalysisResult::fallback() || result == AnalysisResult::busy() {
        warn!("Not storing placeholder analysis result");
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }

    let id = db
        .insert_analysis(&AnalysisInsert {
            image_ref: image.display().to_string(),
            location,
            result,
        })
        .await?;
    let stored = db
        .get_analysis(id)
        .await?
        .ok_or_else(|| anyhow!("Analysis {id} disappeared right after being stored"))?;
    info!("Stored analysis {}", id);
    println!("{}", serde_json::to_string_pretty(&stored)?);
    Ok(())
}

async fn run_ask(db: &Database, analysis_id: i64, question: &str) -> Result<()> {
    require_api_key()?;
    let analysis = db
        .get_analysis(analysis_id)
        .await?
        .ok_or_else(|| anyhow!("Analysis {analysis_id} not found"))?;

    let history: Vec<ChatMessage> = db
        .chat_history(analysis_id)
        .await?
        .into_iter()
        .map(|stored| stored.message)
        .collect();
    let question = question.trim();
    db.insert_chat_message(analysis_id, ChatRole::User, question)
        .await?;

    let analyzer = SoilAnalyzer::from_config(&CONFIG);
    let outcome = analyzer
        .ask_follow_up(
            question,
            &analysis.result.soil_type,
            &analysis.result.characteristics,
            &analysis.result.recommendations,
            &history,
        )
        .await;

    match outcome {
        Ok(reply) => {
            db.insert_chat_message(analysis_id, ChatRole::Assistant, &reply)
                .await?;
            println!("{reply}");
            Ok(())
        }
        Err(err) => {
            error!("Follow-up question failed for analysis {}: {}", analysis_id, err);
            db.insert_chat_message(analysis_id, ChatRole::Assistant, CHAT_APOLOGY_REPLY)
                .await?;
            println!("{CHAT_APOLOGY_REPLY}");
            Err(anyhow!("{RETRY_PROMPT} ({err})"))
        }
    }
}

async fn run_history(db: &Database, limit: i64, search: Option<&str>) -> Result<()> {
    let analyses = match search {
        Some(query) => db.search_analyses(query, limit).await?,
        None => db.list_analyses(limit).await?,
    };
    if analyses.is_empty() {
        println!("Nenhuma análise registrada.");
        return Ok(());
    }
    for analysis in analyses {
        println!(
            "#{} {} {} [{}]{}",
            analysis.id,
            analysis.created_at.format("%Y-%m-%d %H:%M"),
            analysis.result.soil_type,
            analysis.image_ref,
            analysis
                .location
                .as_deref()
                .map(|location| format!(" - {location}"))
                .unwrap_or_default()
        );
    }
    Ok(())
}

async fn run_chat(db: &Database, analysis_id: i64) -> Result<()> {
    if db.get_analysis(analysis_id).await?.is_none() {
        return Err(anyhow!("Analysis {analysis_id} not found"));
    }
    for stored in db.chat_history(analysis_id).await? {
        let label = match stored.message.role {
            ChatRole::User => "Você",
            ChatRole::Assistant => "TerraSense",
        };
        println!("{}: {}", label, stored.message.content);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(values: &[&str]) -> Vec<String> {
        std::iter::once("terrasense")
            .chain(values.iter().copied())
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn parses_analyze_with_location() {
        let command =
            parse_command(&args(&["analyze", "--image", "solo.jpg", "--location", "Roça"])).unwrap();
        assert_eq!(
            command,
            Command::Analyze {
                image: PathBuf::from("solo.jpg"),
                location: Some("Roça".to_string()),
            }
        );
    }

    #[test]
    fn parses_ask() {
        let command = parse_command(&args(&[
            "ask",
            "--analysis-id",
            "7",
            "--question",
            "Posso plantar milho?",
        ]))
        .unwrap();
        assert_eq!(
            command,
            Command::Ask {
                analysis_id: 7,
                question: "Posso plantar milho?".to_string(),
            }
        );
    }

    #[test]
    fn history_limit_defaults_and_clamps() {
        assert_eq!(
            parse_command(&args(&["history"])).unwrap(),
            Command::History {
                limit: DEFAULT_HISTORY_LIMIT,
                search: None,
            }
        );
        assert_eq!(
            parse_command(&args(&["history", "--limit", "0"])).unwrap(),
            Command::History {
                limit: 1,
                search: None,
            }
        );
    }

    #[test]
    fn parses_history_search() {
        assert_eq!(
            parse_command(&args(&["history", "--search", " Arenoso "])).unwrap(),
            Command::History {
                limit: DEFAULT_HISTORY_LIMIT,
                search: Some("Arenoso".to_string()),
            }
        );
        assert_eq!(
            parse_command(&args(&["history", "--search", ""])).unwrap(),
            Command::History {
                limit: DEFAULT_HISTORY_LIMIT,
                search: None,
            }
        );
        assert!(parse_command(&args(&["history", "--search"])).is_err());
    }

    #[test]
    fn rejects_missing_and_invalid_arguments() {
        assert!(parse_command(&args(&[])).is_err());
        assert!(parse_command(&args(&["analyze"])).is_err());
        assert!(parse_command(&args(&["ask", "--analysis-id", "x"])).is_err());
        assert!(parse_command(&args(&["ask", "--analysis-id", "1", "--question", " "])).is_err());
        assert!(parse_command(&args(&["chat", "--verbose"])).is_err());
        assert!(parse_command(&args(&["frobnicate"])).is_err());
    }
}
