//! Engine adapter speaking JSON lines to an external bridge process that
//! hosts the refinement program and the crystallographic library.
//!
//! Request: `{"op": <name>, ...args}`. Response: `{"ok": true, "value": ..}`
//! or `{"ok": false, "error": ".."}`.

use anyhow::{anyhow, Context, Result};
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use std::cell::RefCell;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::rc::Rc;
use tracing::{debug, warn};

use crate::config::ParamValue;
use crate::engine::{CellDim, CrystalLibrary, NormalEquations, RefinedModel, RefinementEngine};

pub fn encode_request(op: &str, args: Value) -> Result<String> {
    let mut body = match args {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            return Err(anyhow!(
                "bridge arguments for {} must be an object, got {}",
                op,
                other
            ))
        }
    };
    body.insert("op".to_string(), Value::String(op.to_string()));
    Ok(serde_json::to_string(&Value::Object(body))?)
}

pub fn decode_response(line: &str) -> Result<Value> {
    let value: Value = serde_json::from_str(line.trim())
        .with_context(|| format!("malformed bridge response: {}", line.trim()))?;
    match value.get("ok").and_then(Value::as_bool) {
        Some(true) => Ok(value.get("value").cloned().unwrap_or(Value::Null)),
        Some(false) => Err(anyhow!(
            "bridge error: {}",
            value.get("error").and_then(Value::as_str).unwrap_or("unspecified")
        )),
        None => Err(anyhow!("bridge response without ok flag: {}", line.trim())),
    }
}

/// Renders a scalar reply the way the host coerces values to text.
fn value_text(value: Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s,
        Value::Bool(true) => "True".to_string(),
        Value::Bool(false) => "False".to_string(),
        other => other.to_string(),
    }
}

/// One bridge connection. Requests are strictly sequential.
pub struct BridgeSession {
    writer: Box<dyn Write>,
    reader: Box<dyn BufRead>,
    child: Option<Child>,
}

impl BridgeSession {
    /// Spawns `command` with piped stdin/stdout; stderr stays attached to
    /// ours so the host's own diagnostics remain visible.
    pub fn spawn(command: &[String]) -> Result<Self> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| anyhow!("empty bridge command"))?;
        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::inherit());
        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawning bridge {}", program))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("bridge stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("bridge stdout unavailable"))?;
        debug!(program = %program, pid = child.id(), "bridge started");
        Ok(Self {
            writer: Box::new(stdin),
            reader: Box::new(BufReader::new(stdout)),
            child: Some(child),
        })
    }

    pub fn from_streams(writer: Box<dyn Write>, reader: Box<dyn BufRead>) -> Self {
        Self {
            writer,
            reader,
            child: None,
        }
    }

    pub fn call(&mut self, op: &str, args: Value) -> Result<Value> {
        let request = encode_request(op, args)?;
        self.writer.write_all(request.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;

        let mut line = String::new();
        let read = self
            .reader
            .read_line(&mut line)
            .with_context(|| format!("reading bridge reply to {}", op))?;
        if read == 0 {
            return Err(anyhow!("bridge closed its output during {}", op));
        }
        decode_response(&line).with_context(|| format!("bridge op {}", op))
    }

    fn call_as<T: DeserializeOwned>(&mut self, op: &str, args: Value) -> Result<T> {
        let value = self.call(op, args)?;
        serde_json::from_value(value).with_context(|| format!("decoding bridge reply to {}", op))
    }

    fn call_text(&mut self, op: &str, args: Value) -> Result<String> {
        self.call(op, args).map(value_text)
    }

    /// Engine and library handles sharing this connection.
    pub fn split(self) -> (BridgeEngine, BridgeLibrary) {
        let shared = Rc::new(RefCell::new(self));
        (
            BridgeEngine {
                session: Rc::clone(&shared),
            },
            BridgeLibrary { session: shared },
        )
    }
}

impl Drop for BridgeSession {
    fn drop(&mut self) {
        // Closing stdin is the bridge's signal to exit.
        self.writer = Box::new(std::io::sink());
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.wait() {
                warn!(error = %e, "bridge did not exit cleanly");
            }
        }
    }
}

pub struct BridgeEngine {
    session: Rc<RefCell<BridgeSession>>,
}

impl BridgeEngine {
    fn call(&mut self, op: &str, args: Value) -> Result<()> {
        self.session.borrow_mut().call(op, args).map(|_| ())
    }

    fn text(&mut self, op: &str, args: Value) -> Result<String> {
        self.session.borrow_mut().call_text(op, args)
    }
}

impl RefinementEngine for BridgeEngine {
    fn load_model(&mut self, path: &Path) -> Result<()> {
        self.call("load_model", json!({ "path": path.to_string_lossy() }))
    }

    fn add_instruction(&mut self, code: &str) -> Result<()> {
        self.call("add_instruction", json!({ "code": code }))
    }

    fn run_command(&mut self, command: &str) -> Result<()> {
        self.call("run_command", json!({ "command": command }))
    }

    fn extinction(&mut self) -> Result<String> {
        self.text("extinction", Value::Null)
    }

    fn set_param(&mut self, name: &str, value: &ParamValue) -> Result<()> {
        self.call("set_param", json!({ "name": name, "value": value }))
    }

    fn get_param(&mut self, name: &str) -> Result<String> {
        self.text("get_param", json!({ "name": name }))
    }

    fn cell(&mut self, dim: CellDim) -> Result<String> {
        self.text("cell", json!({ "dim": dim.as_str() }))
    }

    fn cell_volume(&mut self) -> Result<String> {
        self.text("cell_volume", Value::Null)
    }

    fn z(&mut self) -> Result<String> {
        self.text("z", Value::Null)
    }

    fn z_prime(&mut self) -> Result<String> {
        self.text("z_prime", Value::Null)
    }

    fn npd_count(&mut self) -> Result<usize> {
        self.session.borrow_mut().call_as("npd_count", Value::Null)
    }

    fn reflection_stats(&mut self) -> Result<Vec<(String, String)>> {
        let value = self.session.borrow_mut().call("reflection_stats", Value::Null)?;
        // key order is the engine's; results.txt writes the entries as received
        match value {
            Value::Object(map) => Ok(map.into_iter().map(|(k, v)| (k, value_text(v))).collect()),
            Value::Array(pairs) => pairs
                .into_iter()
                .map(|pair| match pair {
                    Value::Array(kv) if kv.len() == 2 => {
                        let mut kv = kv.into_iter();
                        match (kv.next(), kv.next()) {
                            (Some(Value::String(k)), Some(v)) => Ok((k, value_text(v))),
                            _ => Err(anyhow!("reflection statistic keys must be strings")),
                        }
                    }
                    other => Err(anyhow!(
                        "reflection statistic must be a [key, value] pair, got {}",
                        other
                    )),
                })
                .collect(),
            other => Err(anyhow!("reflection statistics must be an object, got {}", other)),
        }
    }

    fn residual(&mut self, name: &str) -> Result<String> {
        self.text("residual", json!({ "name": name }))
    }

    fn run_cycle_count(&mut self) -> Result<u32> {
        self.session.borrow_mut().call_as("run_cycle_count", Value::Null)
    }
}

pub struct BridgeLibrary {
    session: Rc<RefCell<BridgeSession>>,
}

impl CrystalLibrary for BridgeLibrary {
    fn build_normal_equations(
        &mut self,
        scattering_table: Option<&Path>,
    ) -> Result<NormalEquations> {
        let table = scattering_table.map(|p| p.to_string_lossy());
        self.session
            .borrow_mut()
            .call_as("build_normal_equations", json!({ "scattering_table": table }))
    }

    fn refined_model(&mut self) -> Result<RefinedModel> {
        self.session.borrow_mut().call_as("refined_model", Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[derive(Clone, Default)]
    struct Sent(Rc<RefCell<Vec<u8>>>);

    impl Write for Sent {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Sent {
        fn requests(&self) -> Vec<Value> {
            String::from_utf8_lossy(&self.0.borrow())
                .lines()
                .map(|l| serde_json::from_str(l).expect("request json"))
                .collect()
        }
    }

    fn session(replies: &[&str]) -> (BridgeSession, Sent) {
        let sent = Sent::default();
        let input = replies.iter().map(|r| format!("{}\n", r)).collect::<String>();
        let session =
            BridgeSession::from_streams(Box::new(sent.clone()), Box::new(Cursor::new(input)));
        (session, sent)
    }

    #[test]
    fn requests_carry_op_and_arguments() {
        let line = encode_request("cell", json!({ "dim": "alpha" })).expect("encode");
        let value: Value = serde_json::from_str(&line).expect("json");
        assert_eq!(value, json!({ "op": "cell", "dim": "alpha" }));
        assert_eq!(encode_request("z", Value::Null).expect("encode"), r#"{"op":"z"}"#);
        assert!(encode_request("z", json!([1])).is_err());
    }

    #[test]
    fn responses_decode_or_fail() {
        assert_eq!(decode_response(r#"{"ok": true, "value": 3}"#).expect("ok"), json!(3));
        assert_eq!(decode_response(r#"{"ok": true}"#).expect("ok"), Value::Null);
        let err = decode_response(r#"{"ok": false, "error": "no model"}"#).expect_err("error");
        assert!(err.to_string().contains("no model"));
        assert!(decode_response("not json").is_err());
        assert!(decode_response(r#"{"value": 1}"#).is_err());
    }

    #[test]
    fn engine_calls_round_trip_over_the_session() {
        let (session, sent) = session(&[
            r#"{"ok": true, "value": null}"#,
            r#"{"ok": true, "value": "0.0021(4)"}"#,
            r#"{"ok": true, "value": 0}"#,
            r#"{"ok": true, "value": {"Rint": 0.031, "Completeness": "0.99"}}"#,
            r#"{"ok": true, "value": 12}"#,
        ]);
        let (mut engine, _library) = session.split();
        engine
            .set_param("snum.NoSpherA2.ncpus", &ParamValue::Int(4))
            .expect("set");
        assert_eq!(engine.extinction().expect("exti"), "0.0021(4)");
        assert_eq!(engine.get_param("snum.NoSpherA2.multiplicity").expect("get"), "0");
        let stats = engine.reflection_stats().expect("stats");
        assert_eq!(
            stats,
            vec![
                ("Rint".to_string(), "0.031".to_string()),
                ("Completeness".to_string(), "0.99".to_string()),
            ]
        );
        assert_eq!(engine.run_cycle_count().expect("cycles"), 12);

        let requests = sent.requests();
        assert_eq!(
            requests[0],
            json!({ "op": "set_param", "name": "snum.NoSpherA2.ncpus", "value": 4 })
        );
        assert_eq!(requests[1], json!({ "op": "extinction" }));
        assert_eq!(requests.len(), 5);
    }

    #[test]
    fn library_decodes_normal_equations() {
        let (session, sent) = session(&[r#"{"ok": true, "value": {
            "reflections": [{"f_obs_sq": 100.0, "sigma": 1.0, "f_calc_sq": 81.0, "weight": 1.0}],
            "scale_factor": 1.0,
            "covariance": {"dim": 2, "data": [1.0, 0.5, 2.0]}
        }}"#
        .replace('\n', "")
        .as_str()]);
        let (_engine, mut library) = session.split();
        let eq = library
            .build_normal_equations(Some(Path::new("run.tsc")))
            .expect("equations");
        assert_eq!(eq.reflections.len(), 1);
        assert_eq!(eq.covariance.get(1, 0), Some(0.5));
        assert_eq!(sent.requests()[0]["scattering_table"], "run.tsc");
    }

    #[test]
    fn reflection_stats_keep_engine_order() {
        let (session, _) = session(&[
            r#"{"ok": true, "value": {"Rint": 0.031, "MeanIOverSigma": 25.1, "Completeness": 1.0}}"#,
            r#"{"ok": true, "value": [["Rint", 0.031], ["HKLSource", "a.hkl"], ["Completeness", 1.0]]}"#,
            r#"{"ok": true, "value": [["Rint"]]}"#,
        ]);
        let (mut engine, _) = session.split();
        let keys = |stats: Vec<(String, String)>| -> Vec<String> {
            stats.into_iter().map(|(k, _)| k).collect()
        };
        assert_eq!(
            keys(engine.reflection_stats().expect("object")),
            vec!["Rint", "MeanIOverSigma", "Completeness"]
        );
        assert_eq!(
            keys(engine.reflection_stats().expect("pairs")),
            vec!["Rint", "HKLSource", "Completeness"]
        );
        assert!(engine.reflection_stats().is_err());
    }

    #[test]
    fn closed_bridge_is_an_error() {
        let (session, _) = session(&[]);
        let (mut engine, _) = session.split();
        let err = engine.load_model(Path::new("a.ins")).expect_err("closed");
        assert!(format!("{:#}", err).contains("closed"));
    }
}
