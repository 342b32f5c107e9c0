//! Linearisation of the drawflow graph form of a pipeline.
//!
//! The graph lives under `drawflow.Home.data`: one node per stage with
//! `inputs`/`outputs` connection lists. Nodes without inputs come first;
//! the rest follow in topological order. The first input of a node is the
//! implicit stream predecessor, additional inputs become `connect`
//! attributes of the linearised stage.

use std::collections::{BTreeMap, HashMap};

use serde_json::{json, Map, Value};

use crate::error::{PipelineError, Result};

pub fn linearize(doc: &Value) -> Result<Value> {
    let data = doc
        .pointer("/drawflow/Home/data")
        .and_then(|v| v.as_object())
        .ok_or(PipelineError::MissingKey("drawflow"))?;

    // Deterministic node order: numeric id.
    let mut nodes: BTreeMap<u64, &Value> = BTreeMap::new();
    for (id, node) in data {
        let id = id.parse::<u64>().map_err(|_| PipelineError::InvalidValue {
            key: "drawflow".to_string(),
            reason: format!("node id '{id}' is not a number"),
        })?;
        nodes.insert(id, node);
    }

    // Incoming edges per node, in input-slot order.
    let mut incoming: HashMap<u64, Vec<u64>> = HashMap::new();
    for (&id, node) in &nodes {
        let mut sources = Vec::new();
        if let Some(inputs) = node.get("inputs").and_then(|v| v.as_object()) {
            let mut slots: Vec<(&String, &Value)> = inputs.iter().collect();
            slots.sort_by(|a, b| a.0.cmp(b.0));
            for (_, slot) in slots {
                if let Some(connections) = slot.get("connections").and_then(|v| v.as_array()) {
                    for c in connections {
                        if let Some(source) = c
                            .get("node")
                            .and_then(|v| v.as_str())
                            .and_then(|s| s.parse::<u64>().ok())
                        {
                            sources.push(source);
                        }
                    }
                }
            }
        }
        incoming.insert(id, sources);
    }

    // Kahn's algorithm starting from the nodes with no inputs, visiting
    // lower ids first so the output is stable.
    let mut indegree: HashMap<u64, usize> =
        incoming.iter().map(|(&id, s)| (id, s.len())).collect();
    let mut ready: Vec<u64> = indegree
        .iter()
        .filter(|(_, &d)| d == 0)
        .map(|(&id, _)| id)
        .collect();
    ready.sort_unstable();

    let mut order = Vec::with_capacity(nodes.len());
    while let Some(id) = ready.first().copied() {
        ready.remove(0);
        order.push(id);
        for (&other, sources) in &incoming {
            if sources.contains(&id) {
                let d = indegree.get_mut(&other).unwrap();
                *d = d.saturating_sub(sources.iter().filter(|&&s| s == id).count());
                if *d == 0 && !order.contains(&other) && !ready.contains(&other) {
                    ready.push(other);
                    ready.sort_unstable();
                }
            }
        }
    }

    if order.len() != nodes.len() {
        return Err(PipelineError::InvalidValue {
            key: "drawflow".to_string(),
            reason: "the stage graph has a cycle".to_string(),
        });
    }

    // Emit the linear form.
    let mut pipeline = Vec::with_capacity(order.len());
    for id in order {
        let node = nodes[&id];
        let name = node
            .get("name")
            .and_then(|v| v.as_str())
            .ok_or(PipelineError::MissingKey("name"))?;

        let mut stage = Map::new();
        stage.insert("algoname".to_string(), json!(name));
        if let Some(attrs) = node.get("data").and_then(|v| v.as_object()) {
            for (k, v) in attrs {
                stage.insert(k.clone(), v.clone());
            }
        }
        stage
            .entry("uid".to_string())
            .or_insert_with(|| json!(id.to_string()));

        // Inputs beyond the first become connections by uid.
        let sources = &incoming[&id];
        for (slot, source) in sources.iter().enumerate().skip(1) {
            let key = if slot == 1 { "connect".to_string() } else { format!("connect{slot}") };
            let source_uid = nodes[source]
                .pointer("/data/uid")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
                .unwrap_or_else(|| source.to_string());
            stage.insert(key, json!(source_uid));
        }

        pipeline.push(Value::Object(stage));
    }

    let mut out = Map::new();
    if let Some(processing) = doc.get("processing") {
        out.insert("processing".to_string(), processing.clone());
    }
    out.insert("pipeline".to_string(), Value::Array(pipeline));
    Ok(Value::Object(out))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_chain() {
        let doc = json!({
            "drawflow": { "Home": { "data": {
                "2": { "name": "write_las",
                       "data": { "uid": "bbb", "output": "out.las" },
                       "inputs": { "input_1": { "connections": [ {"node": "1", "input": "output_1"} ] } },
                       "outputs": {} },
                "1": { "name": "reader_las",
                       "data": { "uid": "aaa" },
                       "inputs": {},
                       "outputs": { "output_1": { "connections": [ {"node": "2", "output": "input_1"} ] } } }
            }}}
        });

        let linear = linearize(&doc).unwrap();
        let pipeline = linear["pipeline"].as_array().unwrap();
        assert_eq!(pipeline.len(), 2);
        assert_eq!(pipeline[0]["algoname"], "reader_las");
        assert_eq!(pipeline[1]["algoname"], "write_las");
        assert_eq!(pipeline[1]["output"], "out.las");
    }

    #[test]
    fn second_input_becomes_connect() {
        let doc = json!({
            "drawflow": { "Home": { "data": {
                "1": { "name": "reader_las", "data": { "uid": "r" }, "inputs": {}, "outputs": {} },
                "2": { "name": "triangulate", "data": { "uid": "t" },
                       "inputs": { "input_1": { "connections": [ {"node": "1"} ] } }, "outputs": {} },
                "3": { "name": "rasterize", "data": { "uid": "z", "res": 5.0 },
                       "inputs": {
                           "input_1": { "connections": [ {"node": "2"} ] },
                           "input_2": { "connections": [ {"node": "2"} ] }
                       },
                       "outputs": {} }
            }}}
        });

        let linear = linearize(&doc).unwrap();
        let pipeline = linear["pipeline"].as_array().unwrap();
        assert_eq!(pipeline[2]["algoname"], "rasterize");
        assert_eq!(pipeline[2]["connect"], "t");
    }

    #[test]
    fn cycles_are_rejected() {
        let doc = json!({
            "drawflow": { "Home": { "data": {
                "1": { "name": "a", "data": {},
                       "inputs": { "input_1": { "connections": [ {"node": "2"} ] } }, "outputs": {} },
                "2": { "name": "b", "data": {},
                       "inputs": { "input_1": { "connections": [ {"node": "1"} ] } }, "outputs": {} }
            }}}
        });
        assert!(linearize(&doc).is_err());
    }
}
