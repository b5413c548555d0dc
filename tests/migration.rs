use parking_lot::Mutex;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread;

use vmiop::config::GuestConfig;
use vmiop::types::VGPU_CAP_MIGRATION;
use vmiop::{
    AbiGeneration, BufferRef, ClassSet, DeviceState, Environment, EnvironmentConfig, Handle, MigrationController,
    MigrationStage, ModuleCatalog, Plugin, PluginClass, PluginConfig, PluginContext, PluginDescriptor, PluginInfo,
    ReadProgress, RecordingCallbacks, Result, VmiopError,
};

/// Device whose whole state is a byte string.
#[derive(Default)]
struct Blob {
    state: Mutex<Vec<u8>>,
    incoming: Mutex<Vec<u8>>,
    completions: Mutex<u32>,
}

impl Blob {
    fn with_state(state: &[u8]) -> Self {
        Self { state: Mutex::new(state.to_vec()), ..Self::default() }
    }
}

impl DeviceState for Blob {
    fn save(&self, _stage: MigrationStage) -> Result<Vec<u8>> {
        Ok(self.state.lock().clone())
    }

    fn restore_chunk(&self, chunk: &[u8]) -> Result<()> {
        self.incoming.lock().extend_from_slice(chunk);
        Ok(())
    }

    fn restore_complete(&self) -> Result<()> {
        *self.state.lock() = std::mem::take(&mut *self.incoming.lock());
        *self.completions.lock() += 1;
        Ok(())
    }
}

impl Plugin for Blob {
    fn put_message(&self, _ctx: &PluginContext, buffer: BufferRef) -> Result<()> {
        buffer.release()
    }

    fn device_state(&self) -> Option<&dyn DeviceState> {
        Some(self)
    }
}

fn env_with(blob: &Arc<Blob>, generation: AbiGeneration) -> (Environment, Handle) {
    let info = PluginInfo {
        name: "blob".into(),
        class: PluginClass::Display,
        input_classes: ClassSet::of(PluginClass::Presentation),
        connect_down_allowed: false,
        connect_up_allowed: true,
        generation,
        migration_capabilities: VGPU_CAP_MIGRATION,
    };
    let blob = Arc::clone(blob);
    let mut catalog = ModuleCatalog::new();
    catalog.register("blob", PluginDescriptor::new(info, move || Ok(Box::new(Arc::clone(&blob)) as Box<dyn Plugin>)));
    let callbacks = Arc::new(RecordingCallbacks::new(GuestConfig::default()));
    let env = Environment::new(EnvironmentConfig::default(), callbacks, catalog);
    let handle = env.load_plugin(&PluginConfig { module: "blob".into(), ..PluginConfig::default() }).unwrap();
    (env, handle)
}

#[test]
fn ten_bytes_stream_in_two_reads_and_two_writes() {
    let source_blob = Arc::new(Blob::with_state(b"0123456789"));
    let (source, src) = env_with(&source_blob, AbiGeneration::Extended);
    let dest_blob = Arc::new(Blob::default());
    let (dest, dst) = env_with(&dest_blob, AbiGeneration::Extended);

    source.notify_migration(src, MigrationStage::StopAndCopy).unwrap();
    assert_eq!(source.migrating_plugins(), vec![src]);

    let mut first = [0u8; 5];
    assert_eq!(source.read_device_buffer(src, &mut first), Ok(ReadProgress { remaining: 5, written: 5 }));
    let mut second = [0u8; 5];
    assert_eq!(source.read_device_buffer(src, &mut second), Ok(ReadProgress { remaining: 0, written: 5 }));
    assert_eq!(source.read_device_buffer(src, &mut [0u8; 5]), Ok(ReadProgress { remaining: 0, written: 0 }));

    dest.notify_migration(dst, MigrationStage::StopAndCopy).unwrap();
    dest.write_device_buffer(dst, &first).unwrap();
    dest.write_device_buffer(dst, &second).unwrap();
    dest.notify_migration(dst, MigrationStage::Resume).unwrap();
    assert_eq!(*dest_blob.state.lock(), b"0123456789");
    assert_eq!(*dest_blob.completions.lock(), 1);
    dest.notify_migration(dst, MigrationStage::None).unwrap();
    assert!(dest.migrating_plugins().is_empty());

    source.notify_migration(src, MigrationStage::Resume).unwrap();
    source.notify_migration(src, MigrationStage::None).unwrap();
    assert_eq!(*source_blob.completions.lock(), 0);
}

#[test]
fn pre_copy_streams_then_stop_and_copy_streams_again() {
    let blob = Arc::new(Blob::with_state(b"abc"));
    let (env, h) = env_with(&blob, AbiGeneration::Extended);
    assert_eq!(env.notify_all(MigrationStage::PreCopy), Ok(1));

    let mut out = [0u8; 16];
    assert_eq!(env.read_device_buffer(h, &mut out), Ok(ReadProgress { remaining: 0, written: 3 }));
    *blob.state.lock() = b"abcd".to_vec();

    env.notify_migration(h, MigrationStage::StopAndCopy).unwrap();
    assert_eq!(env.read_device_buffer(h, &mut out), Ok(ReadProgress { remaining: 0, written: 4 }));
    assert_eq!(&out[..4], b"abcd");
}

#[test]
fn illegal_stages_and_calls_are_rejected() {
    let blob = Arc::new(Blob::with_state(b"state"));
    let (env, h) = env_with(&blob, AbiGeneration::Extended);

    assert_eq!(env.notify_migration(h, MigrationStage::Resume), Err(VmiopError::Inval));
    assert_eq!(env.migration_stage(h), Ok(MigrationStage::None));
    assert_eq!(env.write_device_buffer(h, b"x"), Err(VmiopError::Inval));
    assert_eq!(env.read_device_buffer(h, &mut [0u8; 4]), Err(VmiopError::Inval));
    assert_eq!(env.notify_migration(Handle::NULL, MigrationStage::PreCopy), Err(VmiopError::Inval));
    assert_eq!(env.read_device_buffer(Handle::NULL, &mut [0u8; 4]), Err(VmiopError::Inval));

    env.notify_migration(h, MigrationStage::PreCopy).unwrap();
    assert_eq!(env.notify_migration(h, MigrationStage::Resume), Err(VmiopError::Inval));
    assert_eq!(env.migration_stage(h), Ok(MigrationStage::PreCopy));

    env.notify_migration(h, MigrationStage::StopAndCopy).unwrap();
    env.notify_migration(h, MigrationStage::Resume).unwrap();
    assert_eq!(env.read_device_buffer(h, &mut [0u8; 4]), Err(VmiopError::Inval));
    assert!(env.migrating_plugins().contains(&h));
}

#[test]
fn base_generation_has_no_migration_entry_points() {
    let blob = Arc::new(Blob::with_state(b"state"));
    let (env, h) = env_with(&blob, AbiGeneration::Base);
    assert!(!env.is_migration_capable(h));
    assert_eq!(env.notify_all(MigrationStage::PreCopy), Ok(0));
    assert_eq!(env.notify_migration(h, MigrationStage::PreCopy), Err(VmiopError::NotFound));
    assert_eq!(env.read_device_buffer(h, &mut [0u8; 4]), Err(VmiopError::NotFound));
    assert_eq!(env.write_device_buffer(h, b"x"), Err(VmiopError::NotFound));
}

#[test]
fn writes_before_initialization_are_queued_in_order() {
    let blob = Blob::default();
    let controller = MigrationController::new("blob", 8);
    controller.notify(&blob, MigrationStage::StopAndCopy).unwrap();
    controller.write(&blob, b"0123").unwrap();
    controller.write(&blob, b"4567").unwrap();
    assert_eq!(controller.write(&blob, b"8"), Err(VmiopError::Resource));
    assert_eq!(controller.queued_bytes(), 8);
    assert!(blob.incoming.lock().is_empty());

    controller.notify(&blob, MigrationStage::Resume).unwrap();
    assert_eq!(*blob.completions.lock(), 0);

    controller.mark_initialized(&blob).unwrap();
    assert_eq!(controller.queued_bytes(), 0);
    assert_eq!(controller.restored_bytes(), 8);
    assert_eq!(*blob.state.lock(), b"01234567");
    assert_eq!(*blob.completions.lock(), 1);
}

#[test]
fn cancelling_drops_partial_state() {
    let blob = Arc::new(Blob::with_state(b"keep"));
    let (env, h) = env_with(&blob, AbiGeneration::Extended);
    env.notify_migration(h, MigrationStage::StopAndCopy).unwrap();
    env.write_device_buffer(h, b"half").unwrap();
    env.notify_migration(h, MigrationStage::None).unwrap();
    assert_eq!(*blob.state.lock(), b"keep");
    assert_eq!(*blob.completions.lock(), 0);

    env.notify_migration(h, MigrationStage::PreCopy).unwrap();
    assert_eq!(env.read_device_buffer(h, &mut [0u8; 2]), Ok(ReadProgress { remaining: 2, written: 2 }));
    env.notify_migration(h, MigrationStage::None).unwrap();
    assert!(env.migrating_plugins().is_empty());
    assert_eq!(env.read_device_buffer(h, &mut [0u8; 2]), Err(VmiopError::Inval));
}

/// A [`Blob`] whose init announces its handle and then waits to be let go.
struct SlowStart {
    blob: Arc<Blob>,
    started: Mutex<Sender<Handle>>,
    proceed: Mutex<Receiver<()>>,
}

impl Plugin for SlowStart {
    fn init(&self, ctx: &PluginContext) -> Result<()> {
        self.started.lock().send(ctx.handle()).map_err(|_| VmiopError::Inval)?;
        self.proceed.lock().recv().map_err(|_| VmiopError::Inval)
    }

    fn put_message(&self, _ctx: &PluginContext, buffer: BufferRef) -> Result<()> {
        buffer.release()
    }

    fn device_state(&self) -> Option<&dyn DeviceState> {
        Some(&*self.blob)
    }
}

#[test]
fn state_written_during_init_is_applied_afterwards() {
    let blob = Arc::new(Blob::default());
    let (started_tx, started_rx) = mpsc::channel();
    let (proceed_tx, proceed_rx) = mpsc::channel();
    let slow = Arc::new(SlowStart {
        blob: Arc::clone(&blob),
        started: Mutex::new(started_tx),
        proceed: Mutex::new(proceed_rx),
    });
    let info = PluginInfo {
        name: "slow".into(),
        class: PluginClass::Display,
        input_classes: ClassSet::of(PluginClass::Presentation),
        connect_down_allowed: false,
        connect_up_allowed: true,
        generation: AbiGeneration::Extended,
        migration_capabilities: VGPU_CAP_MIGRATION,
    };
    let mut catalog = ModuleCatalog::new();
    catalog.register("slow", PluginDescriptor::new(info, move || Ok(Box::new(Arc::clone(&slow)) as Box<dyn Plugin>)));
    let callbacks = Arc::new(RecordingCallbacks::new(GuestConfig::default()));
    let env = Environment::new(EnvironmentConfig::default(), callbacks, catalog);

    thread::scope(|scope| {
        let loader = scope.spawn(|| env.load_plugin(&PluginConfig { module: "slow".into(), ..PluginConfig::default() }));
        let h = started_rx.recv().unwrap();

        env.notify_migration(h, MigrationStage::StopAndCopy).unwrap();
        env.write_device_buffer(h, b"hel").unwrap();
        env.write_device_buffer(h, b"lo").unwrap();
        env.notify_migration(h, MigrationStage::Resume).unwrap();
        assert!(blob.incoming.lock().is_empty());
        assert_eq!(*blob.completions.lock(), 0);

        proceed_tx.send(()).unwrap();
        assert_eq!(loader.join().unwrap().unwrap(), h);
    });

    assert_eq!(*blob.state.lock(), b"hello");
    assert_eq!(*blob.completions.lock(), 1);
    assert_eq!(env.migration_stage(env.plugins()[0]), Ok(MigrationStage::Resume));
}
