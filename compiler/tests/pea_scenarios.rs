//! End-to-end runs of the escape analysis phase on small graphs

use pea_compiler::ir::dump::dump_graph;
use pea_compiler::ir::optimization::OptimizationPass;
use pea_compiler::ir::validation::validate_graph;
use pea_compiler::ir::{
    BinaryOp, BlockId, Constant, FieldRef, Graph, GraphBuilder, LayoutId, NodeId, NodeKind,
    ObjectLayout, ValueKind, VirtualMapping,
};
use pea_compiler::{logging, PartialEscapePhase, PeaConfig, PeaError, PeaStatistics};

fn run(graph: &mut Graph, config: PeaConfig) -> PeaStatistics {
    logging::init_test();
    let stats = PartialEscapePhase::new(config)
        .run(graph)
        .unwrap_or_else(|e| panic!("escape analysis failed: {}", e));
    if let Err(errors) = validate_graph(graph) {
        for error in &errors {
            eprintln!("  - {}", error);
        }
        panic!("graph is malformed after escape analysis:\n{}", dump_graph(graph));
    }
    stats
}

fn count(graph: &Graph, pred: impl Fn(&NodeKind) -> bool) -> usize {
    graph.live_nodes().filter(|(_, n)| pred(&n.kind)).count()
}

fn allocations(graph: &Graph) -> usize {
    count(graph, |k| matches!(k, NodeKind::NewInstance { .. } | NodeKind::NewArray { .. }))
}

fn materializations(graph: &Graph) -> Vec<NodeId> {
    graph
        .live_nodes()
        .filter(|(_, n)| matches!(n.kind, NodeKind::Materialize { .. }))
        .map(|(id, _)| id)
        .collect()
}

fn terminator(graph: &Graph, block: BlockId) -> NodeId {
    graph.block(block).terminator.expect("block has a terminator")
}

// entry: p = new Point; p.x = x; p.y = y; return p.x
#[test]
fn test_single_block_allocation_disappears() {
    let mut b = GraphBuilder::new("point");
    let layout = b.layout(ObjectLayout::instance("Point", vec![ValueKind::Int, ValueKind::Int]));
    let x = b.param(0, ValueKind::Int);
    let y = b.param(1, ValueKind::Int);
    let p = b.new_instance(layout);
    b.store_field(p, FieldRef::new(layout, 0), x);
    b.store_field(p, FieldRef::new(layout, 1), y);
    let load = b.load_field(p, FieldRef::new(layout, 0));
    let ret = b.ret(Some(load));
    let mut graph = b.finish();

    let stats = run(&mut graph, PeaConfig::default());

    assert_eq!(graph.node(ret).inputs.as_slice(), &[x]);
    assert!(graph.block(graph.entry()).nodes.is_empty());
    assert_eq!(stats.sweeps, 1);
    assert_eq!(stats.allocations_virtualized, 1);
    assert_eq!(stats.stores_eliminated, 2);
    assert_eq!(stats.loads_eliminated, 1);
    assert_eq!(stats.materializations(), 0);
}

//        entry: o = new Box; o.f = x
//        /    \
//     left    right: call escape(o)
//        \    /
//        merge: return o
#[test]
fn test_escape_on_one_branch_materializes_at_merge() {
    let mut b = GraphBuilder::new("branch");
    let layout = b.layout(ObjectLayout::instance("Box", vec![ValueKind::Int]));
    let cond = b.param(0, ValueKind::Int);
    let x = b.param(1, ValueKind::Int);
    let left = b.create_block("left");
    let right = b.create_block("right");
    let merge = b.create_block("merge");
    let o = b.new_instance(layout);
    b.store_field(o, FieldRef::new(layout, 0), x);
    b.branch(cond, left, right);
    b.switch_to_block(left);
    b.goto(merge);
    b.switch_to_block(right);
    let call = b.invoke("escape", &[o], ValueKind::Void);
    b.goto(merge);
    b.switch_to_block(merge);
    let ret = b.ret(Some(o));
    let mut graph = b.finish();

    let stats = run(&mut graph, PeaConfig::default());

    assert_eq!(allocations(&graph), 0);
    let materialized = materializations(&graph);
    assert_eq!(materialized.len(), 2);
    for &m in &materialized {
        assert_eq!(graph.node(m).inputs.as_slice(), &[x]);
    }

    let phis = &graph.block(merge).phis;
    assert_eq!(phis.len(), 1);
    let phi = graph.node(phis[0]);
    assert_eq!(graph.node(ret).inputs.as_slice(), &[phis[0]]);
    assert_eq!(graph.node(phi.inputs[0]).block, Some(left));
    assert_eq!(graph.node(phi.inputs[1]).block, Some(right));
    assert_eq!(graph.node(call).inputs.as_slice(), &[phi.inputs[1]]);

    assert_eq!(stats.materialized_at_merge, 1);
    assert_eq!(stats.materialized_unhandled, 1);
    assert_eq!(stats.phis_created, 1);
}

//   entry: c = new Counter
//     |
//   header <------+
//     |   \       |
//   exit   body: c.n = c.n + 1
//     |
//   return c.n
fn counter_loop() -> (Graph, BlockId, BlockId, NodeId, NodeId) {
    let mut b = GraphBuilder::new("counter");
    let layout = b.layout(ObjectLayout::instance("Counter", vec![ValueKind::Int]));
    let field = FieldRef::new(layout, 0);
    let cond = b.param(0, ValueKind::Int);
    let one = b.int(1);
    let header = b.create_block("header");
    let body = b.create_block("body");
    let exit = b.create_block("exit");
    let c = b.new_instance(layout);
    b.goto(header);
    b.switch_to_block(header);
    b.branch(cond, body, exit);
    b.switch_to_block(body);
    let n = b.load_field(c, field);
    let next = b.binary(BinaryOp::Add, n, one);
    b.store_field(c, field, next);
    b.goto(header);
    b.switch_to_block(exit);
    let result = b.load_field(c, field);
    let ret = b.ret(Some(result));
    (b.finish(), header, exit, next, ret)
}

#[test]
fn test_loop_carried_field_gets_phi_and_proxy() {
    let (mut graph, header, exit, next, ret) = counter_loop();

    let stats = run(&mut graph, PeaConfig::default());

    assert_eq!(allocations(&graph), 0);
    assert!(materializations(&graph).is_empty());
    assert_eq!(count(&graph, |k| matches!(k, NodeKind::LoadField { .. })), 0);

    let phis = &graph.block(header).phis;
    assert_eq!(phis.len(), 1);
    let phi = phis[0];
    let inputs = &graph.node(phi).inputs;
    assert_eq!(graph.node(inputs[0]).as_constant(), Some(Constant::Int(0)));
    assert_eq!(inputs[1], next);
    assert_eq!(graph.node(next).inputs[0], phi);

    let proxy = graph.block(exit).nodes[0];
    assert!(matches!(graph.node(proxy).kind, NodeKind::Proxy));
    assert_eq!(graph.node(proxy).inputs.as_slice(), &[phi]);
    assert_eq!(graph.node(ret).inputs.as_slice(), &[proxy]);

    assert_eq!(stats.phis_created, 1);
    assert_eq!(stats.proxies_created, 1);
    assert_eq!(stats.loop_iterations, 2);
}

#[test]
fn test_loop_iteration_bound_aborts_without_changes() {
    let (mut graph, header, _, _, _) = counter_loop();
    let before = dump_graph(&graph);
    let config = PeaConfig {
        max_loop_iterations: 1,
        ..PeaConfig::default()
    };

    // The counter loop settles on its second round, so a bound of one
    // rolls back the first round and gives up
    match PartialEscapePhase::new(config.clone()).run(&mut graph) {
        Err(PeaError::LoopDidNotConverge { header: h, iterations }) => {
            assert_eq!(h, header);
            assert_eq!(iterations, 1);
        }
        other => panic!("expected non-convergence, got {:?}", other),
    }
    assert_eq!(dump_graph(&graph), before);

    // As a pipeline pass the failure is reported as "no change"
    let result = PartialEscapePhase::new(config).run_on_graph(&mut graph);
    assert!(!result.modified);
    assert_eq!(dump_graph(&graph), before);
}

#[test]
fn test_loop_bound_counts_the_converging_round() {
    let (mut graph, _, _, _, _) = counter_loop();
    let config = PeaConfig {
        max_loop_iterations: 2,
        ..PeaConfig::default()
    };

    let stats = run(&mut graph, config.clone());

    assert_eq!(stats.loop_iterations, config.max_loop_iterations);
    assert_eq!(allocations(&graph), 0);
}

//   entry
//     |
//   header <---+
//     |   \    |
//   exit   body
#[test]
fn test_loop_without_allocations_is_left_alone() {
    let mut b = GraphBuilder::new("spin");
    let cond = b.param(0, ValueKind::Int);
    let header = b.create_block("header");
    let body = b.create_block("body");
    let exit = b.create_block("exit");
    b.goto(header);
    b.switch_to_block(header);
    b.branch(cond, body, exit);
    b.switch_to_block(body);
    b.goto(header);
    b.switch_to_block(exit);
    b.ret(None);
    let mut graph = b.finish();
    let before = dump_graph(&graph);

    let stats = run(&mut graph, PeaConfig::default());

    assert_eq!(stats.sweeps, 0);
    assert_eq!(dump_graph(&graph), before);
}

// v0 = o.f; loop { o.f = o.f + 1 }; return o.f
fn read_loop() -> (Graph, [BlockId; 2], [NodeId; 4]) {
    let mut b = GraphBuilder::new("read_loop");
    let layout = b.layout(ObjectLayout::instance("Counter", vec![ValueKind::Int]));
    let field = FieldRef::new(layout, 0);
    let o = b.param(0, ValueKind::Object);
    let cond = b.param(1, ValueKind::Int);
    let one = b.int(1);
    let header = b.create_block("header");
    let body = b.create_block("body");
    let exit = b.create_block("exit");
    let v0 = b.load_field(o, field);
    b.goto(header);
    b.switch_to_block(header);
    b.branch(cond, body, exit);
    b.switch_to_block(body);
    let n = b.load_field(o, field);
    let next = b.binary(BinaryOp::Add, n, one);
    b.store_field(o, field, next);
    b.goto(header);
    b.switch_to_block(exit);
    let r = b.load_field(o, field);
    let ret = b.ret(Some(r));
    (b.finish(), [header, exit], [v0, n, next, ret])
}

#[test]
fn test_cached_read_flows_around_loop_and_out_through_proxy() {
    let (mut graph, [header, exit], [v0, n, next, ret]) = read_loop();

    let stats = run(&mut graph, PeaConfig::default());

    assert!(graph.is_alive(v0));
    assert!(!graph.is_alive(n));
    assert_eq!(count(&graph, |k| matches!(k, NodeKind::LoadField { .. })), 1);
    assert_eq!(count(&graph, |k| matches!(k, NodeKind::StoreField { .. })), 1);

    let phis = &graph.block(header).phis;
    assert_eq!(phis.len(), 1);
    let phi = phis[0];
    assert_eq!(graph.node(phi).inputs.as_slice(), &[v0, next]);
    assert_eq!(graph.node(next).inputs[0], phi);

    let proxy = graph.block(exit).nodes[0];
    assert!(matches!(graph.node(proxy).kind, NodeKind::Proxy));
    assert_eq!(graph.node(proxy).inputs.as_slice(), &[phi]);
    assert_eq!(graph.node(ret).inputs.as_slice(), &[proxy]);

    // The second sweep finds the phi and proxy already in place
    assert_eq!(stats.sweeps, 1);
    assert_eq!(stats.loads_eliminated, 2);
    assert_eq!(stats.phis_created, 1);
    assert_eq!(stats.proxies_created, 1);
    assert_eq!(stats.loop_iterations, 2);
}

//        entry
//        /    \
//  left: a = o.f   right: o.f = x
//        \    /
//        merge: return o.f
#[test]
fn test_differing_cached_reads_merge_into_phi() {
    let mut b = GraphBuilder::new("read_diamond");
    let layout = b.layout(ObjectLayout::instance("Box", vec![ValueKind::Int]));
    let field = FieldRef::new(layout, 0);
    let o = b.param(0, ValueKind::Object);
    let cond = b.param(1, ValueKind::Int);
    let x = b.param(2, ValueKind::Int);
    let left = b.create_block("left");
    let right = b.create_block("right");
    let merge = b.create_block("merge");
    b.branch(cond, left, right);
    b.switch_to_block(left);
    let a = b.load_field(o, field);
    b.goto(merge);
    b.switch_to_block(right);
    b.store_field(o, field, x);
    b.goto(merge);
    b.switch_to_block(merge);
    let r = b.load_field(o, field);
    let ret = b.ret(Some(r));
    let mut graph = b.finish();

    let stats = run(&mut graph, PeaConfig::default());

    assert!(!graph.is_alive(r));
    let phis = &graph.block(merge).phis;
    assert_eq!(phis.len(), 1);
    let phi = phis[0];
    assert_eq!(graph.node(phi).inputs.as_slice(), &[a, x]);
    assert_eq!(graph.node(ret).inputs.as_slice(), &[phi]);
    assert_eq!(stats.sweeps, 1);
    assert_eq!(stats.loads_eliminated, 1);
    assert_eq!(stats.phis_created, 1);
}

// a = o.f0; b = o.f0; o.f1 = x; c = o.f0; q.f0 = y; d = o.f0
fn redundant_loads() -> (Graph, [NodeId; 4], [NodeId; 3]) {
    let mut b = GraphBuilder::new("reads");
    let layout = b.layout(ObjectLayout::instance("Pair", vec![ValueKind::Int, ValueKind::Int]));
    let f0 = FieldRef::new(layout, 0);
    let f1 = FieldRef::new(layout, 1);
    let o = b.param(0, ValueKind::Object);
    let q = b.param(1, ValueKind::Object);
    let x = b.param(2, ValueKind::Int);
    let y = b.param(3, ValueKind::Int);
    let a = b.load_field(o, f0);
    let second = b.load_field(o, f0);
    b.store_field(o, f1, x);
    let c = b.load_field(o, f0);
    b.store_field(q, f0, y);
    let d = b.load_field(o, f0);
    let s1 = b.binary(BinaryOp::Add, a, second);
    let s2 = b.binary(BinaryOp::Add, s1, c);
    let s3 = b.binary(BinaryOp::Add, s2, d);
    b.ret(Some(s3));
    (b.finish(), [a, second, c, d], [s1, s2, s3])
}

#[test]
fn test_read_elimination_respects_location_identity() {
    let (mut graph, [a, second, c, d], [s1, s2, s3]) = redundant_loads();

    let stats = run(&mut graph, PeaConfig::default());

    assert!(!graph.is_alive(second));
    assert!(!graph.is_alive(c));
    assert!(graph.is_alive(d));
    assert_eq!(graph.node(s1).inputs.as_slice(), &[a, a]);
    assert_eq!(graph.node(s2).inputs.as_slice(), &[s1, a]);
    assert_eq!(graph.node(s3).inputs.as_slice(), &[s2, d]);
    assert_eq!(count(&graph, |k| matches!(k, NodeKind::StoreField { .. })), 2);
    assert_eq!(stats.loads_eliminated, 2);
    assert_eq!(stats.stores_eliminated, 0);
}

#[test]
fn test_no_op_sweep_leaves_graph_untouched() {
    let (mut graph, _, _) = redundant_loads();
    let before = dump_graph(&graph);
    let next_id = graph.next_id();

    let stats = run(&mut graph, PeaConfig::escape_analysis_only());

    assert_eq!(stats.sweeps, 0);
    assert_eq!(dump_graph(&graph), before);
    assert_eq!(graph.next_id(), next_id);
}

// a.next = c; c.next = a; return a
#[test]
fn test_cyclic_objects_materialize_with_deferred_store() {
    let mut b = GraphBuilder::new("cycle");
    let layout = b.layout(ObjectLayout::instance("Node", vec![ValueKind::Object, ValueKind::Int]));
    let next = FieldRef::new(layout, 0);
    let a = b.new_instance(layout);
    let c = b.new_instance(layout);
    b.store_field(a, next, c);
    b.store_field(c, next, a);
    let ret = b.ret(Some(a));
    let mut graph = b.finish();

    let stats = run(&mut graph, PeaConfig::default());

    assert_eq!(allocations(&graph), 0);
    let nodes = graph.block(graph.entry()).nodes.clone();
    assert_eq!(nodes.len(), 3);
    let (mat_c, mat_a, store) = (nodes[0], nodes[1], nodes[2]);
    assert!(matches!(graph.node(mat_c).kind, NodeKind::Materialize { .. }));
    assert!(matches!(graph.node(mat_a).kind, NodeKind::Materialize { .. }));
    assert_eq!(graph.node(graph.node(mat_c).inputs[0]).as_constant(), Some(Constant::Null));
    assert_eq!(graph.node(mat_a).inputs[0], mat_c);
    assert!(matches!(graph.node(store).kind, NodeKind::StoreField { field } if field == next));
    assert_eq!(graph.node(store).inputs.as_slice(), &[mat_c, mat_a]);
    assert_eq!(graph.node(ret).inputs.as_slice(), &[mat_a]);
    assert_eq!(stats.materialized_unhandled, 2);
}

#[test]
fn test_balanced_locks_on_virtual_object_are_removed() {
    let mut b = GraphBuilder::new("locks");
    let layout = b.layout(ObjectLayout::instance("Mutex", vec![ValueKind::Int]));
    let m = b.new_instance(layout);
    b.monitor_enter(m, 1);
    let call = b.invoke("tick", &[], ValueKind::Void);
    b.monitor_exit(m, 1);
    b.ret(None);
    let mut graph = b.finish();

    run(&mut graph, PeaConfig::default());

    assert_eq!(allocations(&graph), 0);
    let monitors = count(&graph, |k| {
        matches!(k, NodeKind::MonitorEnter { .. } | NodeKind::MonitorExit { .. })
    });
    assert_eq!(monitors, 0);

    // The locked object is described to the call's frame state
    let state = graph.node(call).state.expect("invoke keeps its frame state");
    match &graph.node(state).kind {
        NodeKind::FrameState { mappings, .. } => {
            assert_eq!(mappings.len(), 1);
            assert!(matches!(mappings[0], VirtualMapping::Virtual { .. }));
        }
        other => panic!("unexpected state node {:?}", other),
    }
}

#[test]
fn test_escaping_locked_object_keeps_its_locks() {
    let mut b = GraphBuilder::new("locked escape");
    let layout = b.layout(ObjectLayout::instance("Mutex", vec![ValueKind::Int]));
    let m = b.new_instance(layout);
    b.monitor_enter(m, 7);
    let call = b.invoke("publish", &[m], ValueKind::Void);
    let exit = b.monitor_exit(m, 7);
    b.ret(None);
    let mut graph = b.finish();

    run(&mut graph, PeaConfig::default());

    let materialized = materializations(&graph);
    assert_eq!(materialized.len(), 1);
    let value = materialized[0];
    assert!(matches!(&graph.node(value).kind, NodeKind::Materialize { locks, .. } if locks == &vec![7]));
    assert_eq!(graph.node(call).inputs.as_slice(), &[value]);
    assert_eq!(graph.node(exit).inputs.as_slice(), &[value]);
    assert_eq!(count(&graph, |k| matches!(k, NodeKind::MonitorEnter { .. })), 0);
}

#[test]
fn test_deoptimization_state_describes_virtual_object() {
    let mut b = GraphBuilder::new("deopt");
    let layout = b.layout(ObjectLayout::instance("Box", vec![ValueKind::Int]));
    let x = b.param(0, ValueKind::Int);
    let o = b.new_instance(layout);
    b.store_field(o, FieldRef::new(layout, 0), x);
    let deopt = b.deoptimize(&[o]);
    let mut graph = b.finish();

    run(&mut graph, PeaConfig::default());

    assert_eq!(allocations(&graph), 0);
    let state = graph.node(deopt).state.expect("deoptimize keeps its frame state");
    let node = graph.node(state);
    let object = node.inputs[0];
    assert!(matches!(graph.node(object).kind, NodeKind::VirtualObject { layout: l, .. } if l == layout));
    match &node.kind {
        NodeKind::FrameState { mappings, .. } => {
            assert_eq!(
                mappings.as_slice(),
                &[VirtualMapping::Virtual { object, values: vec![x] }]
            );
        }
        other => panic!("unexpected state node {:?}", other),
    }
}

//        entry
//        /    \
//  left: a    right: b        (identity-free Complex values)
//        \    /
//        merge: p = phi(a, b); return p.re
#[test]
fn test_phi_of_value_objects_stays_virtual() {
    let mut b = GraphBuilder::new("values");
    let layout = b.layout(ObjectLayout::instance("Complex", vec![ValueKind::Int]).without_identity());
    let re = FieldRef::new(layout, 0);
    let cond = b.param(0, ValueKind::Int);
    let one = b.int(1);
    let two = b.int(2);
    let left = b.create_block("left");
    let right = b.create_block("right");
    let merge = b.create_block("merge");
    b.branch(cond, left, right);
    b.switch_to_block(left);
    let a = b.new_instance(layout);
    b.store_field(a, re, one);
    b.goto(merge);
    b.switch_to_block(right);
    let c = b.new_instance(layout);
    b.store_field(c, re, two);
    b.goto(merge);
    b.switch_to_block(merge);
    let p = b.phi(merge, ValueKind::Object, &[a, c]);
    let load = b.load_field(p, re);
    let ret = b.ret(Some(load));
    let mut graph = b.finish();

    let stats = run(&mut graph, PeaConfig::default());

    assert_eq!(allocations(&graph), 0);
    assert!(materializations(&graph).is_empty());
    assert!(!graph.is_alive(p));
    let phis = &graph.block(merge).phis;
    assert_eq!(phis.len(), 1);
    assert_eq!(graph.node(phis[0]).inputs.as_slice(), &[one, two]);
    assert_eq!(graph.node(ret).inputs.as_slice(), &[phis[0]]);
    assert_eq!(stats.allocations_virtualized, 2);
}

#[test]
fn test_wide_value_in_int_array_round_trips() {
    let mut b = GraphBuilder::new("array");
    let layout = b.layout(ObjectLayout::array("int[4]", ValueKind::Int, 4));
    let w = b.param(0, ValueKind::Long);
    let zero = b.int(0);
    let array = b.new_array(layout);
    b.store_indexed(array, zero, w, ValueKind::Long);
    let load = b.load_indexed(array, zero, ValueKind::Long);
    let length = b.array_length(array);
    let sum = b.binary(BinaryOp::Add, length, zero);
    let call = b.invoke("use", &[load, sum], ValueKind::Void);
    b.ret(None);
    let mut graph = b.finish();

    run(&mut graph, PeaConfig::default());

    assert_eq!(allocations(&graph), 0);
    let inputs = &graph.node(call).inputs;
    assert_eq!(inputs[0], w);
    // length + 0 folds once the length is known
    assert_eq!(graph.node(inputs[1]).as_constant(), Some(Constant::Int(4)));
    assert!(!graph.is_alive(sum));
}

#[test]
fn test_oversized_allocation_is_not_virtualized() {
    let mut b = GraphBuilder::new("big");
    let layout = b.layout(ObjectLayout::array("int[64]", ValueKind::Int, 64));
    let array = b.new_array(layout);
    let length = b.array_length(array);
    b.ret(Some(length));
    let mut graph = b.finish();
    let before = dump_graph(&graph);

    let stats = run(&mut graph, PeaConfig::escape_analysis_only());

    assert_eq!(stats.sweeps, 0);
    assert_eq!(dump_graph(&graph), before);
    assert_eq!(graph.layout(LayoutId(0)).entry_count(), 64);
}
