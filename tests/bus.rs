use parking_lot::Mutex;
use std::sync::{Arc, OnceLock};
use std::thread;

use vmiop::config::GuestConfig;
use vmiop::{
    AbiGeneration, BufferRef, ClassSet, Direction, Environment, EnvironmentConfig, Handle, ModuleCatalog, Node,
    Placement, Plugin, PluginClass, PluginConfig, PluginContext, PluginDescriptor, PluginGraph, PluginInfo,
    RecordingCallbacks, Result, VmiopError,
};

#[derive(Default)]
struct Recorder {
    received: Mutex<Vec<Vec<u8>>>,
    forward: Option<Direction>,
    forwarded: Mutex<Vec<Result<()>>>,
    keep: bool,
    kept: Mutex<Vec<BufferRef>>,
    graph: OnceLock<Arc<PluginGraph>>,
    nested: Mutex<Vec<(bool, Result<usize>)>>,
    attached_at_shutdown: Mutex<Vec<bool>>,
}

impl Recorder {
    fn forwarding(direction: Direction) -> Self {
        Self { forward: Some(direction), ..Self::default() }
    }

    fn received(&self) -> Vec<Vec<u8>> {
        self.received.lock().clone()
    }
}

impl Plugin for Recorder {
    fn shutdown(&self, ctx: &PluginContext) -> Result<()> {
        if let Some(graph) = self.graph.get() {
            self.attached_at_shutdown.lock().push(graph.contains(ctx.handle()));
        }
        Ok(())
    }

    fn put_message(&self, ctx: &PluginContext, buffer: BufferRef) -> Result<()> {
        self.received.lock().push(buffer.to_vec());
        if let Some(direction) = self.forward {
            self.forwarded.lock().push(ctx.deliver(&buffer, direction));
        }
        if let Some(graph) = self.graph.get() {
            let info = info("intruder", PluginClass::Null, ClassSet::EMPTY);
            let attempt = graph.attach(Node::new(Handle::from_raw(0xdead), &info), Placement::Top);
            self.nested.lock().push((vmiop::bus::in_callback(), attempt));
        }
        if self.keep {
            self.kept.lock().push(buffer);
            return Ok(());
        }
        buffer.release()
    }
}

fn info(name: &str, class: PluginClass, accepts: ClassSet) -> PluginInfo {
    PluginInfo {
        name: name.to_string(),
        class,
        input_classes: accepts,
        connect_down_allowed: true,
        connect_up_allowed: true,
        generation: AbiGeneration::Base,
        migration_capabilities: 0,
    }
}

/// Builds an environment whose stack holds `plugins`, bottom first.
fn stack(plugins: Vec<(PluginInfo, Arc<Recorder>)>) -> (Environment, Vec<Handle>) {
    let mut catalog = ModuleCatalog::new();
    for (info, recorder) in &plugins {
        let recorder = Arc::clone(recorder);
        let descriptor = PluginDescriptor::new(info.clone(), move || Ok(Box::new(Arc::clone(&recorder)) as Box<dyn Plugin>));
        catalog.register(&info.name, descriptor);
    }
    let callbacks = Arc::new(RecordingCallbacks::new(GuestConfig::default()));
    let env = Environment::new(EnvironmentConfig::default(), callbacks, catalog);
    let handles = plugins
        .iter()
        .map(|(info, _)| {
            let config = PluginConfig { module: info.name.clone(), ..PluginConfig::default() };
            env.load_plugin(&config).unwrap()
        })
        .collect();
    (env, handles)
}

fn message(env: &Environment, source: PluginClass, bytes: &[u8]) -> BufferRef {
    let mut buffer = env.pool().allocate(source, PluginClass::Presentation, 1, bytes.len() as u32).unwrap();
    buffer.data_mut(0).unwrap().copy_from_slice(bytes);
    buffer
}

#[test]
fn class_mismatch_leaves_reference_with_caller() {
    let device = Arc::new(Recorder::default());
    let sink = Arc::new(Recorder::default());
    let (env, h) = stack(vec![
        (info("device", PluginClass::Display, ClassSet::of(PluginClass::Presentation)), device),
        (info("sink", PluginClass::Presentation, ClassSet::of(PluginClass::Presentation)), Arc::clone(&sink)),
    ]);

    let buffer = message(&env, PluginClass::Display, b"frame");
    assert_eq!(env.deliver(h[0], &buffer, Direction::Up), Err(VmiopError::NotFound));
    assert!(sink.received().is_empty());
    assert_eq!(buffer.references(), 1);
    buffer.release().unwrap();
    assert_eq!(env.pool().live_buffers(), 0);
}

#[test]
fn delivery_is_ordered_and_references_balance() {
    let device = Arc::new(Recorder::default());
    let sink = Arc::new(Recorder::default());
    let (env, h) = stack(vec![
        (info("device", PluginClass::Display, ClassSet::EMPTY), device),
        (info("sink", PluginClass::Presentation, ClassSet::of(PluginClass::Display)), Arc::clone(&sink)),
    ]);

    for i in 0u8..5 {
        let buffer = message(&env, PluginClass::Display, &[i; 3]);
        env.deliver(h[0], &buffer, Direction::Up).unwrap();
        assert_eq!(buffer.references(), 1);
        buffer.release().unwrap();
    }
    assert_eq!(sink.received(), (0u8..5).map(|i| vec![i; 3]).collect::<Vec<_>>());
    assert_eq!(env.pool().live_buffers(), 0);
    assert_eq!(env.pool().allocations(), env.pool().releases());

    let buffer = message(&env, PluginClass::Display, b"x");
    assert_eq!(env.deliver(h[0], &buffer, Direction::Down), Err(VmiopError::NotFound));
    assert_eq!(env.deliver(Handle::NULL, &buffer, Direction::Up), Err(VmiopError::Inval));
    assert_eq!(env.deliver(Handle::from_raw(4242), &buffer, Direction::Up), Err(VmiopError::NotFound));
}

#[test]
fn non_acceptors_are_skipped() {
    let middle = Arc::new(Recorder::default());
    let top = Arc::new(Recorder::default());
    let (env, h) = stack(vec![
        (info("device", PluginClass::Display, ClassSet::EMPTY), Arc::new(Recorder::default())),
        (info("middle", PluginClass::Presentation, ClassSet::of(PluginClass::Presentation)), Arc::clone(&middle)),
        (info("top", PluginClass::Presentation, ClassSet::of(PluginClass::Display)), Arc::clone(&top)),
    ]);

    let buffer = message(&env, PluginClass::Display, b"skip");
    env.deliver(h[0], &buffer, Direction::Up).unwrap();
    buffer.release().unwrap();
    assert!(middle.received().is_empty());
    assert_eq!(top.received(), vec![b"skip".to_vec()]);
}

#[test]
fn chained_forwarding_reaches_the_top() {
    let relay = Arc::new(Recorder::forwarding(Direction::Up));
    let top = Arc::new(Recorder::default());
    let (env, h) = stack(vec![
        (info("device", PluginClass::Display, ClassSet::EMPTY), Arc::new(Recorder::default())),
        (info("relay", PluginClass::Presentation, ClassSet::of(PluginClass::Display)), Arc::clone(&relay)),
        (info("top", PluginClass::Presentation, ClassSet::of(PluginClass::Display)), Arc::clone(&top)),
    ]);

    let buffer = message(&env, PluginClass::Display, b"chain");
    env.deliver(h[0], &buffer, Direction::Up).unwrap();
    buffer.release().unwrap();

    assert_eq!(relay.received(), vec![b"chain".to_vec()]);
    assert_eq!(top.received(), vec![b"chain".to_vec()]);
    assert_eq!(*relay.forwarded.lock(), vec![Ok(())]);
    assert_eq!(env.pool().live_buffers(), 0);
}

#[test]
fn retained_buffers_outlive_the_caller() {
    let keeper = Arc::new(Recorder { keep: true, ..Recorder::default() });
    let (env, h) = stack(vec![
        (info("device", PluginClass::Display, ClassSet::EMPTY), Arc::new(Recorder::default())),
        (info("keeper", PluginClass::Presentation, ClassSet::of(PluginClass::Display)), Arc::clone(&keeper)),
    ]);

    let mut buffer = message(&env, PluginClass::Display, b"async");
    env.deliver(h[0], &buffer, Direction::Up).unwrap();
    assert_eq!(buffer.references(), 2);
    assert_eq!(buffer.set_discard_config(true), Err(VmiopError::ReadOnly));
    buffer.release().unwrap();
    assert_eq!(env.pool().live_buffers(), 1);

    let kept: Vec<BufferRef> = keeper.kept.lock().drain(..).collect();
    assert_eq!(kept[0].to_vec(), b"async");
    for buffer in kept {
        buffer.release().unwrap();
    }
    assert_eq!(env.pool().live_buffers(), 0);
}

#[test]
fn graph_changes_are_refused_inside_put_message() {
    let sink = Arc::new(Recorder::default());
    let (env, h) = stack(vec![
        (info("device", PluginClass::Display, ClassSet::EMPTY), Arc::new(Recorder::default())),
        (info("sink", PluginClass::Presentation, ClassSet::of(PluginClass::Display)), Arc::clone(&sink)),
    ]);
    assert!(sink.graph.set(Arc::clone(env.graph())).is_ok());

    let buffer = message(&env, PluginClass::Display, b"nested");
    env.deliver(h[0], &buffer, Direction::Up).unwrap();
    buffer.release().unwrap();

    assert_eq!(*sink.nested.lock(), vec![(true, Err(VmiopError::NotAllowedInCallback))]);
    assert!(!vmiop::bus::in_callback());
    assert_eq!(env.plugins(), h);
}

#[test]
fn delivery_to_an_unloaded_plugin_fails() {
    let sink = Arc::new(Recorder::default());
    let (env, h) = stack(vec![
        (info("device", PluginClass::Display, ClassSet::EMPTY), Arc::new(Recorder::default())),
        (info("sink", PluginClass::Presentation, ClassSet::of(PluginClass::Display)), Arc::clone(&sink)),
    ]);
    env.unload_plugin(h[1]).unwrap();

    let buffer = message(&env, PluginClass::Display, b"late");
    assert_eq!(env.deliver(h[0], &buffer, Direction::Up), Err(VmiopError::NotFound));
    buffer.release().unwrap();
    assert!(sink.received().is_empty());
}


#[test]
fn unloaded_plugins_are_detached_before_shutdown() {
    let sink = Arc::new(Recorder::default());
    let (env, h) = stack(vec![
        (info("device", PluginClass::Display, ClassSet::EMPTY), Arc::new(Recorder::default())),
        (info("sink", PluginClass::Presentation, ClassSet::of(PluginClass::Display)), Arc::clone(&sink)),
    ]);
    assert!(sink.graph.set(Arc::clone(env.graph())).is_ok());

    env.unload_plugin(h[1]).unwrap();
    assert_eq!(*sink.attached_at_shutdown.lock(), vec![false]);
    assert_eq!(env.plugins(), vec![h[0]]);
    assert_eq!(env.unload_plugin(h[1]), Err(VmiopError::NotFound));
}

#[test]
fn concurrent_deliveries_release_the_buffer_once() {
    const THREADS: usize = 8;
    const ROUNDS: usize = 50;
    let sink = Arc::new(Recorder::default());
    let (env, h) = stack(vec![
        (info("device", PluginClass::Display, ClassSet::EMPTY), Arc::new(Recorder::default())),
        (info("sink", PluginClass::Presentation, ClassSet::of(PluginClass::Display)), Arc::clone(&sink)),
    ]);

    let buffer = message(&env, PluginClass::Display, b"shared");
    thread::scope(|scope| {
        for _ in 0..THREADS {
            let mine = buffer.retain();
            let env = &env;
            let device = h[0];
            scope.spawn(move || {
                for _ in 0..ROUNDS {
                    let extra = mine.retain();
                    env.deliver(device, &extra, Direction::Up).unwrap();
                    extra.release().unwrap();
                }
                mine.release().unwrap();
            });
        }
    });

    assert_eq!(buffer.references(), 1);
    assert_eq!(env.pool().releases(), 0);
    buffer.release().unwrap();
    assert_eq!(env.pool().releases(), 1);
    assert_eq!(env.pool().live_buffers(), 0);
    assert_eq!(sink.received().len(), THREADS * ROUNDS);
}
