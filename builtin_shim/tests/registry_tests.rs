// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Tests for the builtin module registry driving real synthesis.

mod common;

use builtin_shim::image::layout::FILE_DLL;
use builtin_shim::{
    BridgeConfig, BuiltinRegistry, DllSearchPath, HostServices, LoadedModule, ModuleTemplate,
    NameResolver, NativeHandle, NativeNaming, SyntheticImage,
};
use common::{DirectoryLoader, FakeAddressSpace, RecordingViews};
use std::sync::{Arc, Mutex};

type Deliveries = Arc<Mutex<Vec<(Option<SyntheticImage>, String)>>>;

fn registry(loader: DirectoryLoader, views: RecordingViews) -> BuiltinRegistry {
    let config = BridgeConfig::default().with_naming(NativeNaming::new("lib", ".so"));
    let space = FakeAddressSpace::default();
    let host = HostServices {
        mapper: Box::new(space.clone()),
        locator: Box::new(space.locator()),
        views: Box::new(views),
        loader: Box::new(loader),
    };
    let resolver = NameResolver::with_search_path(&config, DllSearchPath::new(["/a", "/b"]));
    BuiltinRegistry::new(host, &config).with_resolver(resolver)
}

fn install(registry: &mut BuiltinRegistry) -> Deliveries {
    let deliveries = Deliveries::default();
    let sink = Arc::clone(&deliveries);
    registry.install_callback(move |image, filename| {
        sink.lock().unwrap().push((image, filename.to_string()));
    });
    deliveries
}

fn leak(template: ModuleTemplate) -> &'static ModuleTemplate {
    Box::leak(Box::new(template))
}

#[test]
fn test_two_libraries_and_main_executable() {
    let views = RecordingViews::default();
    let mut registry = registry(DirectoryLoader::new("/b"), views.clone());

    registry.register(leak(ModuleTemplate::library()), "L1").unwrap();
    registry.register(leak(ModuleTemplate::library()), "L2").unwrap();
    registry
        .register(leak(ModuleTemplate::main_executable()), "app.exe")
        .unwrap();
    assert!(!registry.has_callback());
    assert!(views.ranges().is_empty());

    let deliveries = install(&mut registry);
    let deliveries = deliveries.lock().unwrap();
    let names: Vec<&str> = deliveries.iter().map(|(_, name)| name.as_str()).collect();
    assert_eq!(names, vec!["L1", "L2", ""]);
    assert!(deliveries.iter().all(|(image, _)| image.is_some()));

    let characteristics: Vec<u16> = deliveries
        .iter()
        .map(|(image, _)| image.unwrap().nt_headers().file_header.characteristics & FILE_DLL)
        .collect();
    assert_eq!(characteristics, vec![FILE_DLL, FILE_DLL, 0]);

    // Code and data registered once per image.
    assert_eq!(views.ranges().len(), 6);
    assert!(registry.has_callback());
    assert_eq!(registry.pending_count(), 0);
}

#[test]
fn test_each_registration_delivered_once() {
    let mut registry = registry(DirectoryLoader::new("/b"), RecordingViews::default());
    registry.register(leak(ModuleTemplate::library()), "one.dll").unwrap();
    let deliveries = install(&mut registry);
    registry.register(leak(ModuleTemplate::library()), "two.dll").unwrap();

    let result = registry.load_by_name("one.dll");
    // Already delivered, so the name goes to the host loader instead.
    assert!(matches!(result, Ok(LoadedModule::Native(_))));

    let names: Vec<String> = deliveries
        .lock()
        .unwrap()
        .iter()
        .map(|(_, name)| name.clone())
        .collect();
    assert_eq!(names, vec!["one.dll", "two.dll"]);
}

#[test]
fn test_load_by_name_through_search_path() {
    let loader = DirectoryLoader::new("/b");
    let mut registry = registry(loader.clone(), RecordingViews::default());
    let _deliveries = install(&mut registry);

    let loaded = registry.load_by_name("foo.dll").unwrap();
    assert_eq!(*loader.attempts.lock().unwrap(), vec!["/a/libfoo.so", "/b/libfoo.so"]);
    let LoadedModule::Native(handle) = loaded else {
        panic!("expected a native handle, got {loaded:?}");
    };
    assert_eq!(handle, NativeHandle::new(0x5002));

    registry.unload(loaded);
    assert_eq!(*loader.closed.lock().unwrap(), vec![handle]);
}

#[test]
fn test_load_by_name_failure() {
    let loader = DirectoryLoader::new("/nowhere");
    let mut registry = registry(loader.clone(), RecordingViews::default());
    let _deliveries = install(&mut registry);

    assert!(registry.load_by_name("foo.dll").is_err());
    assert_eq!(
        *loader.attempts.lock().unwrap(),
        vec!["/a/libfoo.so", "/b/libfoo.so", "libfoo.so"]
    );
}

#[test]
fn test_main_executable_opened_by_literal_name() {
    let loader = DirectoryLoader::new("app");
    let registry = registry(loader.clone(), RecordingViews::default());
    let handle = registry.open_main_executable("app", false).unwrap();
    assert_eq!(handle, NativeHandle::new(0x5001));
    assert_eq!(*loader.attempts.lock().unwrap(), vec!["app"]);
}
