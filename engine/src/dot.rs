// dot.rs — Graphviz DOT output for plan graphs
//
// Transforms a PlanGraph into DOT format suitable for rendering with `dot`.
// Ops are boxes, arrays are ellipses; requested outputs are drawn bold and
// materialized arrays are filled.
//
// Preconditions: `graph` is a constructed (optionally optimized) PlanGraph.
// Postconditions: returns a valid DOT string representing the graph.
// Failure modes: none (pure string formatting).
// Side effects: none.

use std::fmt::Write;

use crate::graph::{ArrayNode, OpNode, PlanGraph};

/// Emit the plan graph as a Graphviz DOT string.
pub fn emit_dot(graph: &PlanGraph) -> String {
    let mut buf = String::new();
    writeln!(buf, "digraph plan {{").unwrap();
    writeln!(buf, "    rankdir=TB;").unwrap();
    writeln!(buf, "    node [fontname=\"Helvetica\", fontsize=10];").unwrap();
    writeln!(buf, "    edge [fontname=\"Helvetica\", fontsize=9];").unwrap();

    writeln!(buf).unwrap();
    for op in graph.ops() {
        write_op(&mut buf, op);
    }

    writeln!(buf).unwrap();
    for array in graph.arrays() {
        write_array(&mut buf, array, graph.is_output(array.id));
    }

    writeln!(buf).unwrap();
    for op in graph.ops() {
        for (i, source) in op.sources.iter().enumerate() {
            if op.sources.len() > 1 {
                writeln!(buf, "    {} -> {} [label=\"{i}\"];", node_id(source), node_id(&op.id))
                    .unwrap();
            } else {
                writeln!(buf, "    {} -> {};", node_id(source), node_id(&op.id)).unwrap();
            }
        }
        writeln!(buf, "    {} -> {};", node_id(&op.id), node_id(&op.output)).unwrap();
    }

    writeln!(buf, "}}").unwrap();
    buf
}

fn write_op(buf: &mut String, op: &OpNode) {
    let mut lines = vec![format!("{}", op.id), op.kind.clone()];
    if let Some(p) = &op.primitive {
        if let Some(program) = p.program() {
            lines.push(escape(&program.describe()));
        }
        lines.push(format!("tasks: {}", p.num_tasks));
        lines.push(format!("projected mem: {}", p.projected_mem));
        if p.num_stages() > 1 {
            lines.push(format!("stages: {}", p.num_stages()));
        }
    }
    if !op.fused.is_empty() {
        let fused: Vec<String> = op.fused.iter().map(|id| id.to_string()).collect();
        lines.push(format!("fused: {}", fused.join(", ")));
    }
    let style = if op.primitive.is_some() {
        "shape=box, style=rounded"
    } else {
        "shape=box, style=\"rounded,dashed\""
    };
    writeln!(
        buf,
        "    {} [{style}, label=\"{}\"];",
        node_id(&op.id),
        lines.join("\\n")
    )
    .unwrap();
}

fn write_array(buf: &mut String, array: &ArrayNode, output: bool) {
    let meta = &array.meta;
    let label = format!(
        "{}\\nshape: {:?}\\nchunks: {:?}\\ndtype: {}",
        array.id,
        meta.shape,
        meta.chunks.chunksize(),
        meta.dtype
    );
    let mut attrs = vec!["shape=ellipse".to_string()];
    if array.is_materialized() {
        attrs.push("style=filled".to_string());
        attrs.push("fillcolor=gray92".to_string());
    }
    if output {
        attrs.push("penwidth=2".to_string());
    }
    writeln!(
        buf,
        "    {} [{}, label=\"{label}\"];",
        node_id(&array.id),
        attrs.join(", ")
    )
    .unwrap();
}

/// DOT node identifier for an id whose display form is `kind-NNN`.
fn node_id(id: &impl std::fmt::Display) -> String {
    id.to_string().replace('-', "_")
}

fn escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}
