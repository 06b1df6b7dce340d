//! Caller-facing reply shape for a finished request.

use serde::Serialize;
use serde_json::Value;

use crate::error::{Error, Result};

/// Evaluation digest of an analysis response.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub winrate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score_lead: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pv: Option<Vec<String>>,
}

impl Summary {
    pub fn is_empty(&self) -> bool {
        self.winrate.is_none() && self.score_lead.is_none() && self.pv.is_none()
    }
}

/// `{ok, engine, bestMove, summary, response}` or `{ok: false, engine, error}`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AskReply {
    pub ok: bool,
    pub engine: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub best_move: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<Summary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip)]
    status: u16,
}

impl AskReply {
    pub fn from_result(engine: impl Into<String>, result: Result<Value>) -> Self {
        let engine = engine.into();
        match result {
            Ok(response) => {
                let best = best_candidate(&response);
                let best_move = best
                    .and_then(|c| c.get("move"))
                    .and_then(Value::as_str)
                    .map(str::to_string);
                let summary = summarize(&response, best);
                Self {
                    ok: true,
                    engine,
                    best_move,
                    summary: Some(summary).filter(|s| !s.is_empty()),
                    response: Some(response),
                    error: None,
                    status: 200,
                }
            }
            Err(e) => {
                let status = match &e {
                    Error::Timeout { .. } => 504,
                    e if e.is_retryable() => 503,
                    _ => 500,
                };
                Self::failure(engine, e.to_string(), status)
            }
        }
    }

    /// A request that never reached an engine because it was unusable.
    pub fn rejected(engine: impl Into<String>, message: impl Into<String>) -> Self {
        Self::failure(engine.into(), message.into(), 400)
    }

    fn failure(engine: String, message: String, status: u16) -> Self {
        Self {
            ok: false,
            engine,
            best_move: None,
            summary: None,
            response: None,
            error: Some(message),
            status,
        }
    }

    /// HTTP-style status for a web front end.
    pub fn status_code(&self) -> u16 {
        self.status
    }
}

fn candidate_rank(candidate: &Value) -> Option<f64> {
    candidate
        .get("visits")
        .and_then(Value::as_f64)
        .or_else(|| candidate.get("weight").and_then(Value::as_f64))
}

/// The `moveInfos` entry with the most visits (or weight). Earlier entries win ties.
fn best_candidate(response: &Value) -> Option<&Value> {
    let mut best: Option<(&Value, f64)> = None;
    for candidate in response.get("moveInfos")?.as_array()? {
        let rank = candidate_rank(candidate).unwrap_or(f64::NEG_INFINITY);
        match best {
            Some((_, top)) if rank <= top => {}
            _ => best = Some((candidate, rank)),
        }
    }
    best.map(|(candidate, _)| candidate)
}

fn summarize(response: &Value, best: Option<&Value>) -> Summary {
    let root = response.get("rootInfo");
    Summary {
        winrate: root.and_then(|r| r.get("winrate")).and_then(Value::as_f64),
        score_lead: root.and_then(|r| r.get("scoreLead")).and_then(Value::as_f64),
        pv: best.and_then(|c| c.get("pv")).and_then(Value::as_array).map(|pv| {
            pv.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        }),
    }
}
