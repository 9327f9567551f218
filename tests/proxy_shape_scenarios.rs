//! End-to-end behaviour of proxy shapes, listener nodes and layer locks
//! driven through the plugin host.

use std::io::Write;

use mayausd::layers::LayerLock;
use mayausd::nodes::{DependencyGraph, NodeId, PlugData};
use mayausd::proxy_shape::attr;
use mayausd::proxy_shape::listener_base::{
    ProxyShapeListenerBase, OUT_STAGE_CACHE_ID, RESYNC_ID, STAGE_CACHE_ID, UPDATE_ID,
};
use mayausd::usd::{InitialLoadSet, ObjectsChanged, SdfPath, Stage, StageWeak, TimeCode, Value};
use mayausd::{classify_objects_changed, ChangeType, MayaUsdConfig, PluginHost, StageNoticeListener};

const CUBE: &str = r#"#usda 1.0

def Xform "cube"
{
}
"#;

const BALL: &str = r#"#usda 1.0

def Sphere "ball"
{
    double radius = 1
}
"#;

fn write_usda(dir: &tempfile::TempDir, name: &str, body: &str) -> String {
    let path = dir.path().join(name);
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(body.as_bytes()).unwrap();
    path.to_string_lossy().into_owned()
}

fn path(text: &str) -> SdfPath {
    SdfPath::new(text).unwrap()
}

fn host() -> PluginHost {
    let host = PluginHost::new(MayaUsdConfig::default());
    host.initialize();
    host
}

fn counters(graph: &DependencyGraph, node: NodeId) -> (i64, i64) {
    let update = graph.get_value(node, UPDATE_ID).unwrap().as_int().unwrap();
    let resync = graph.get_value(node, RESYNC_ID).unwrap().as_int().unwrap();
    (update, resync)
}

fn listener_stage(graph: &DependencyGraph, node: NodeId) -> Option<Stage> {
    graph
        .with_node(node, |n: &ProxyShapeListenerBase| n.listener_stage())
        .unwrap()
}

#[test]
fn scenario_a_file_path_resolves_prim() {
    let dir = tempfile::tempdir().unwrap();
    let file = write_usda(&dir, "cube.usda", CUBE);
    let host = host();
    let shape = host.create_proxy_shape("cubeProxy").unwrap();
    host.graph().set_value(shape, attr::FILE_PATH, file.as_str()).unwrap();
    host.graph().set_value(shape, attr::PRIM_PATH, "/").unwrap();

    let proxy = host.proxy_shape(shape).unwrap();
    assert!(proxy.is_stage_valid());
    let children = proxy.usd_prim().children();
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].name(), "cube");
}

#[test]
fn scenario_b_resync_bumps_both_counters_once() {
    let host = host();
    let stage = Stage::create_in_memory("scenarioB.usda");
    stage.define_prim(&path("/world"), "Xform").unwrap();
    stage.define_prim(&path("/world/doomed"), "Cube").unwrap();
    let id = host.stage_cache().insert(stage.clone());

    let node = host.create_listener_node("listener").unwrap();
    let graph = host.graph();
    graph.set_value(node, STAGE_CACHE_ID, id.to_i64()).unwrap();
    let before = counters(graph, node);

    let mut listener = StageNoticeListener::new();
    listener.set_stage(Some(&stage));
    let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = seen.clone();
    listener.set_stage_objects_changed_callback(move |notice| {
        sink.lock().unwrap().push(classify_objects_changed(notice));
    });

    stage.remove_prim(&path("/world/doomed")).unwrap();

    assert_eq!(*seen.lock().unwrap(), vec![ChangeType::Resync]);
    assert_eq!(counters(graph, node), (before.0 + 1, before.1 + 1));
    listener.revoke();
}

#[test]
fn scenario_c_unknown_cache_id_passes_through() {
    let host = host();
    let node = host.create_listener_node("listener").unwrap();
    let graph = host.graph();
    graph.set_value(node, STAGE_CACHE_ID, 9_999i64).unwrap();

    assert_eq!(
        graph.get_value(node, OUT_STAGE_CACHE_ID).unwrap().as_int(),
        Some(9_999)
    );
    assert!(listener_stage(graph, node).is_none());
}

#[test]
fn scenario_d_later_lock_supersedes() {
    let host = host();
    let stage = Stage::create_in_memory("scenarioD.usda");
    let layer = stage.root_layer();
    let locks = host.locked_layers();

    locks.lock_layer("|proxy|proxyShape", layer, LayerLock::Locked);
    locks.lock_layer("|proxy|proxyShape", layer, LayerLock::SystemLocked);
    assert!(!locks.is_layer_locked(layer));
    assert!(locks.is_layer_system_locked(layer));
}

#[test]
fn classification_partitions_notices() {
    let cases = [
        (vec![], vec![], ChangeType::Ignored),
        (vec![], vec![path("/a.radius")], ChangeType::Update),
        (vec![path("/a")], vec![], ChangeType::Resync),
        (vec![path("/a")], vec![path("/b.size")], ChangeType::Resync),
    ];
    for (resynced, changed, expected) in cases {
        let notice = ObjectsChanged::new(StageWeak::default(), resynced, changed);
        assert_eq!(classify_objects_changed(&notice), expected);
    }
}

#[test]
fn listener_counters_never_decrease() {
    let host = host();
    let graph = host.graph();
    let node = host.create_listener_node("listener").unwrap();

    let first = Stage::create_in_memory("first.usda");
    first.define_prim(&path("/a"), "Sphere").unwrap();
    first.set_attribute(&path("/a"), "radius", Value::Double(1.0)).unwrap();
    let second = Stage::create_in_memory("second.usda");
    let first_id = host.stage_cache().insert(first.clone());
    let second_id = host.stage_cache().insert(second.clone());

    let mut last = counters(graph, node);
    let mut check = |expect_resync: bool| {
        let now = counters(graph, node);
        assert!(now.0 >= last.0 && now.1 >= last.1);
        if !expect_resync {
            assert_eq!(now.1, last.1);
        }
        last = now;
    };

    graph.set_value(node, STAGE_CACHE_ID, first_id.to_i64()).unwrap();
    check(true);
    first.set_attribute(&path("/a"), "radius", Value::Double(2.0)).unwrap();
    check(false);
    graph.set_value(node, STAGE_CACHE_ID, second_id.to_i64()).unwrap();
    check(true);
    second.define_prim(&path("/b"), "Xform").unwrap();
    check(true);
    graph.set_value(node, STAGE_CACHE_ID, -1i64).unwrap();
    check(true);
}

#[test]
fn set_stage_twice_is_idempotent() {
    let stage = Stage::create_in_memory("twice.usda");
    let mut listener = StageNoticeListener::new();
    listener.set_stage(Some(&stage));
    let once = stage.objects_changed().listener_count();
    listener.set_stage(Some(&stage));

    assert_eq!(stage.objects_changed().listener_count(), once);
    assert!(listener.stage().unwrap().ptr_eq(&stage));
    assert!(listener.is_subscribed());
    listener.revoke();
    assert_eq!(stage.objects_changed().listener_count(), 0);
}

#[test]
fn bounding_box_cached_per_time_and_cleared_by_file_change() {
    let dir = tempfile::tempdir().unwrap();
    let ball = write_usda(&dir, "ball.usda", BALL);
    let cube = write_usda(&dir, "cube.usda", CUBE);
    let host = host();
    let shape = host.create_proxy_shape("bounds").unwrap();
    let graph = host.graph();
    graph.set_value(shape, attr::FILE_PATH, ball.as_str()).unwrap();
    graph.set_value(shape, attr::TIME, TimeCode::new(1.0)).unwrap();

    let proxy = host.proxy_shape(shape).unwrap();
    let first = proxy.bounding_box();
    let recomputes = proxy.state().bounding_box_stats().recomputes;
    assert_eq!(proxy.bounding_box(), first);
    assert_eq!(proxy.state().bounding_box_stats().recomputes, recomputes);

    graph.set_value(shape, attr::FILE_PATH, cube.as_str()).unwrap();
    assert_eq!(proxy.state().bounding_box_cache_len(), 0);
    proxy.bounding_box();
    assert_eq!(proxy.state().bounding_box_cache_len(), 1);
}

#[test]
fn lock_states_are_exclusive() {
    let host = host();
    let stage = Stage::create_in_memory("exclusive.usda");
    let layer = stage.root_layer();
    let locks = host.locked_layers();

    for state in [
        LayerLock::Locked,
        LayerLock::SystemLocked,
        LayerLock::Unlocked,
        LayerLock::SystemLocked,
        LayerLock::Locked,
    ] {
        locks.lock_layer("|proxy|proxyShape", layer, state);
        assert!(!(locks.is_layer_locked(layer) && locks.is_layer_system_locked(layer)));
        assert_eq!(locks.lock_state(layer), state);
    }
}

#[test]
fn new_scene_clears_every_lock() {
    let host = host();
    let first = Stage::create_in_memory("first.usda");
    let second = Stage::create_in_memory("second.usda");
    let locks = host.locked_layers();
    locks.lock_layer("|a|aShape", first.root_layer(), LayerLock::Locked);
    locks.lock_layer("|b|bShape", second.root_layer(), LayerLock::SystemLocked);

    host.graph().new_scene();

    for layer in [first.root_layer(), second.root_layer()] {
        assert!(!locks.is_layer_locked(layer));
        assert!(!locks.is_layer_system_locked(layer));
    }
}

#[test]
fn shapes_with_different_variants_keep_their_own_stages() {
    let dir = tempfile::tempdir().unwrap();
    let file = write_usda(&dir, "cube.usda", CUBE);
    let host = host();
    let graph = host.graph();
    let shading = |selection: &str| {
        PlugData::StringArray(vec![format!("/cube{{shading={}}}", selection)])
    };

    let red_shape = host.create_proxy_shape("red").unwrap();
    graph.set_value(red_shape, attr::FILE_PATH, file.as_str()).unwrap();
    graph.set_value(red_shape, attr::VARIANT_SELECTIONS, shading("red")).unwrap();
    let red = host.proxy_shape(red_shape).unwrap().stage().unwrap();

    let blue_shape = host.create_proxy_shape("blue").unwrap();
    graph.set_value(blue_shape, attr::FILE_PATH, file.as_str()).unwrap();
    graph.set_value(blue_shape, attr::VARIANT_SELECTIONS, shading("blue")).unwrap();
    let blue = host.proxy_shape(blue_shape).unwrap().stage().unwrap();

    assert!(!red.ptr_eq(&blue));
    assert!(host.stage_cache().id_of(&red).is_some());
    assert!(host.stage_cache().id_of(&blue).is_some());

    // Re-pulling the first shape still hands back its original stage
    graph.set_value(red_shape, attr::TIME, TimeCode::new(2.0)).unwrap();
    let red_again = host.proxy_shape(red_shape).unwrap().stage().unwrap();
    assert!(red_again.ptr_eq(&red));
    assert_eq!(
        red_again
            .prim_at_path(&path("/cube"))
            .variant_selection("shading")
            .as_deref(),
        Some("red")
    );
}

#[test]
fn lock_applies_to_every_stage_on_the_file() {
    let dir = tempfile::tempdir().unwrap();
    let file = write_usda(&dir, "cube.usda", CUBE);
    let host = host();
    let first = Stage::open(&file, InitialLoadSet::LoadAll).unwrap();
    let second = Stage::open(&file, InitialLoadSet::LoadAll).unwrap();
    assert!(std::sync::Arc::ptr_eq(first.root_layer(), second.root_layer()));

    let locks = host.locked_layers();
    locks.lock_layer("|first|firstShape", first.root_layer(), LayerLock::Locked);
    assert!(locks.is_layer_locked(second.root_layer()));
    assert!(second
        .set_attribute(&path("/cube"), "size", Value::Double(2.0))
        .is_err());

    locks.lock_layer("|first|firstShape", first.root_layer(), LayerLock::Unlocked);
    assert!(second
        .set_attribute(&path("/cube"), "size", Value::Double(2.0))
        .is_ok());
}

#[test]
fn edit_through_one_stage_notifies_the_other() {
    let dir = tempfile::tempdir().unwrap();
    let file = write_usda(&dir, "cube.usda", CUBE);
    let first = Stage::open(&file, InitialLoadSet::LoadAll).unwrap();
    let second = Stage::open(&file, InitialLoadSet::LoadAll).unwrap();

    let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = seen.clone();
    let key = second.on_objects_changed(move |notice| {
        sink.lock().unwrap().push(classify_objects_changed(notice));
    });

    first
        .set_attribute(&path("/cube"), "size", Value::Double(3.0))
        .unwrap();
    assert_eq!(*seen.lock().unwrap(), vec![ChangeType::Update]);
    assert_eq!(
        second
            .prim_at_path(&path("/cube"))
            .attribute("size", TimeCode::default()),
        Some(Value::Double(3.0))
    );
    key.revoke();
}
