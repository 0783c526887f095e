// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use serde_json::json;

fn playbook(v: serde_json::Value) -> Playbook {
    serde_json::from_value(v).unwrap()
}

#[test]
fn minimal_document_deserializes() {
    let pb = playbook(json!({
        "metadata": {"path": "examples/weather", "name": "weather"},
        "workload": {"city": "A"},
        "workflow": [
            {"step": "start", "next": [{"then": "fetch"}]},
            {"step": "fetch", "tool": {"kind": "http", "url": "https://x"}},
        ],
    }));

    assert_eq!(pb.metadata.name, "weather");
    assert_eq!(pb.workflow.len(), 2);
    let fetch = pb.step("fetch").unwrap();
    let tool = pb.resolve_tool(fetch).unwrap();
    assert_eq!(tool.kind, "http");
    assert_eq!(tool.params["url"], json!("https://x"));
}

#[test]
fn start_falls_back_to_first_step() {
    let pb = playbook(json!({"workflow": [{"step": "alpha"}]}));
    assert_eq!(pb.start().unwrap().step, "alpha");
}

#[test]
fn workbook_task_merges_with_step_overrides() {
    let pb = playbook(json!({
        "workbook": {
            "fetch_page": {"kind": "http", "url": "https://api", "method": "GET"},
        },
        "workflow": [
            {"step": "a", "task": "fetch_page", "tool": {"kind": "", "method": "POST"}},
        ],
    }));

    let tool = pb.resolve_tool(pb.step("a").unwrap()).unwrap();
    assert_eq!(tool.kind, "http");
    assert_eq!(tool.params["method"], json!("POST"));
    assert_eq!(tool.params["url"], json!("https://api"));
}

#[test]
fn loop_step_parses_mode_and_iterator() {
    let pb = playbook(json!({
        "workflow": [{
            "step": "cities",
            "tool": {"kind": "http"},
            "loop": {"in": "{{ workload.cities }}", "iterator": "city", "mode": "async"},
        }],
    }));

    let step = pb.step("cities").unwrap();
    let loop_def = step.loop_def.as_ref().unwrap();
    assert_eq!(loop_def.iterator, "city");
    assert_eq!(loop_def.mode, noetl_core::LoopMode::Async);
}

#[test]
fn next_rule_target_accepts_then_or_step() {
    let then_rule: NextRule = serde_json::from_value(json!({"when": "{{ x }}", "then": "a"})).unwrap();
    let step_rule: NextRule = serde_json::from_value(json!({"step": "b"})).unwrap();
    assert_eq!(then_rule.target(), Some("a"));
    assert_eq!(step_rule.target(), Some("b"));
    assert!(!then_rule.is_else());
    assert!(step_rule.is_else());
}

#[test]
fn case_else_fail_detected() {
    let pb = playbook(json!({
        "workflow": [{
            "step": "risky",
            "tool": {"kind": "http"},
            "case": [
                {"when": "{{ _err.kind == 'not_found' }}", "then": "skip"},
                {"do": "fail"},
            ],
        }],
    }));

    assert_eq!(pb.step("risky").unwrap().case_else(), Some(ElseAction::Fail));
}

#[test]
fn routing_only_and_terminal_detection() {
    let pb = playbook(json!({
        "workflow": [
            {"step": "route", "next": [{"then": "end"}]},
            {"step": "end"},
        ],
    }));

    assert!(pb.step("route").unwrap().is_routing_only());
    assert!(!pb.step("route").unwrap().is_terminal());
    assert!(pb.step("end").unwrap().is_terminal());
}

#[test]
fn pipeline_step_parses_tasks_and_catch() {
    let pb = playbook(json!({
        "workflow": [{
            "step": "etl",
            "pipe": [
                {"name": "extract", "tool": {"kind": "http", "url": "x"}},
                {"name": "load", "task": "store_rows"},
            ],
            "catch": {"cond": "{{ _err.kind == 'not_found' }}", "result": {"rows": 0}},
            "finally": {"name": "cleanup", "tool": {"kind": "shell"}},
        }],
    }));

    let step = pb.step("etl").unwrap();
    assert!(step.has_pipeline());
    assert_eq!(step.pipe.len(), 2);
    assert_eq!(step.pipe[1].task.as_deref(), Some("store_rows"));
    assert!(step.catch.as_ref().unwrap().cond.is_some());
    assert_eq!(step.finally.as_ref().unwrap().name, "cleanup");
}
