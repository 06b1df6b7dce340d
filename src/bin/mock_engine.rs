//! mock-engine - a stand-in analysis worker speaking the line protocol.
//!
//! Usage: `mock-engine analysis -model <file> -config <file>`
//!
//! Each stdin line is a JSON request carrying an `id`. Requests are answered
//! concurrently, so answers come back in completion order. Optional request
//! fields steer the behaviour:
//! - `mockDelayMs`: time spent "searching" before the final answer
//! - `mockPartials`: number of in-progress messages sent before the final one
//! - `mockOmitMarker`: leave `isDuringSearch` out of the final answer
//! - `mockError`: answer with an `error` field instead
//! - `mockWarning`: send a `warning` for the id before answering
//! - `mockNoise`: emit a non-JSON line and an answer for an unknown id first
//! - `mockHang`: never answer
//! - `mockCrash`: exit immediately with status 3

use std::io::{BufRead, Write};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde_json::{json, Value};

const VERSION: &str = "0.1.0";
const CRASH_EXIT_CODE: i32 = 3;

type SharedOut = Arc<Mutex<std::io::Stdout>>;

fn emit(out: &SharedOut, message: &Value) {
    let mut out = out.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let _ = writeln!(out, "{}", message);
    let _ = out.flush();
}

fn emit_raw(out: &SharedOut, line: &str) {
    let mut out = out.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let _ = writeln!(out, "{}", line);
    let _ = out.flush();
}

fn flag(request: &Value, field: &str) -> bool {
    request.get(field).and_then(Value::as_bool).unwrap_or(false)
}

fn analysis(id: &Value, request: &Value, during_search: Option<bool>, visits: u64) -> Value {
    let turn = request
        .get("moves")
        .and_then(Value::as_array)
        .map(|m| m.len())
        .unwrap_or(0);
    let mut message = json!({
        "id": id,
        "turnNumber": turn,
        "moveInfos": [
            {"move": "D4", "visits": visits / 2, "winrate": 0.48, "scoreLead": 0.4, "pv": ["D4", "Q16"]},
            {"move": "Q16", "visits": visits, "winrate": 0.52, "scoreLead": 1.3, "pv": ["Q16", "D4", "R4"]}
        ],
        "rootInfo": {"winrate": 0.52, "scoreLead": 1.3, "visits": visits + visits / 2},
        "pid": std::process::id(),
        "echo": request,
    });
    if let (Some(marker), Some(obj)) = (during_search, message.as_object_mut()) {
        obj.insert("isDuringSearch".to_string(), Value::Bool(marker));
    }
    message
}

fn handle(out: SharedOut, request: Value) {
    let id = request.get("id").cloned().unwrap_or(Value::Null);

    if flag(&request, "mockNoise") {
        emit_raw(&out, "this line is not json");
        emit(&out, &json!({"id": "req_nobody_asked", "isDuringSearch": false}));
    }
    if let Some(warning) = request.get("mockWarning").and_then(Value::as_str) {
        emit(&out, &json!({"id": id, "warning": warning, "field": "rules"}));
    }
    if let Some(message) = request.get("mockError").and_then(Value::as_str) {
        emit(&out, &json!({"id": id, "error": message}));
        return;
    }
    if flag(&request, "mockHang") {
        return;
    }

    let delay = request.get("mockDelayMs").and_then(Value::as_u64).unwrap_or(0);
    let partials = request.get("mockPartials").and_then(Value::as_u64).unwrap_or(0);
    let step = Duration::from_millis(delay / (partials + 1));

    for n in 1..=partials {
        thread::sleep(step);
        emit(&out, &analysis(&id, &request, Some(true), n * 10));
    }
    thread::sleep(step);

    let marker = if flag(&request, "mockOmitMarker") {
        None
    } else {
        Some(false)
    };
    emit(&out, &analysis(&id, &request, marker, 120));
}

fn arg_after<'a>(args: &'a [String], name: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == name)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let (model, config) = match (arg_after(&args, "-model"), arg_after(&args, "-config")) {
        (Some(model), Some(config)) if args.first().map(String::as_str) == Some("analysis") => {
            (model.to_string(), config.to_string())
        }
        _ => {
            eprintln!("usage: mock-engine analysis -model <file> -config <file>");
            std::process::exit(2);
        }
    };

    let model_name = std::path::Path::new(&model)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "mock-model".to_string());

    eprintln!("MockEngine v{}", VERSION);
    eprintln!("Using config file {}", config);
    eprintln!("Mock backend thread 0: initialized");
    eprintln!("Model name: {}", model_name);
    eprintln!("Model version 11");
    eprintln!("Started, ready to begin handling requests");

    let out: SharedOut = Arc::new(Mutex::new(std::io::stdout()));
    let stdin = std::io::stdin();

    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }

        let request: Value = match serde_json::from_str(&line) {
            Ok(value @ Value::Object(_)) => value,
            _ => {
                emit(&out, &json!({"error": "Could not parse input line as json request"}));
                continue;
            }
        };

        if flag(&request, "mockCrash") {
            eprintln!("mock crash requested");
            std::process::exit(CRASH_EXIT_CODE);
        }

        let out = Arc::clone(&out);
        thread::spawn(move || handle(out, request));
    }
}
