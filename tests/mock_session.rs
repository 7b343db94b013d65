//! End-to-end session runs against the in-process mock backend.

use std::sync::{Arc, Mutex};

use accel_session::mock::MockLoader;
use accel_session::{
    DispatchConfig, Dispatcher, Error, LifecycleState, LogLevel, Logger, OutputDataType, Session,
    SessionConfig, Status,
};

fn capture(level: LogLevel) -> (Arc<Logger>, Arc<Mutex<Vec<String>>>) {
    let lines = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&lines);
    let logger = Logger::new(
        Arc::new(move |level: LogLevel, _: u64, msg: &str| {
            sink.lock().unwrap().push(format!("{level}: {msg}"));
        }),
        level,
    );
    (Arc::new(logger), lines)
}

#[test]
fn toml_configured_session_runs() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("session.toml");
    std::fs::write(
        &config_path,
        r#"
backend_path = "libAccelHtp.so"
model_path = "libmobilenet.so"
output_data_type = "float-and-native"
profiling = "basic"
op_packages = ["libCustomOps.so:CustomOpsInterfaceProvider"]

[tuning]
precision = "float32"
optimization_level = 3
"#,
    )
    .unwrap();
    let config = SessionConfig::from_file(&config_path).unwrap();
    assert_eq!(config.output_data_type, OutputDataType::FloatAndNative);

    let loader = MockLoader::new();
    let (logger, lines) = capture(LogLevel::Debug);
    let mut session = Session::create(config, &loader, logger).unwrap();
    assert_eq!(session.state(), LifecycleState::Executable);
    assert_eq!(loader.state().op_packages.len(), 1);

    session.load_float_inputs(&[[1.0f32; 4]], 0).unwrap();
    session.execute_graphs().unwrap();

    let floats = session.get_float_outputs(0).unwrap();
    assert_eq!(floats, vec![vec![4.0, 5.0], vec![4.0, 5.0, 6.0]]);
    let native = session.get_native_outputs(0).unwrap();
    assert_eq!(native[1], vec![8, 10, 12]);
    assert_eq!(native[0].len(), 2 * std::mem::size_of::<f32>());

    drop(session);
    assert_eq!(loader.calls().last().map(String::as_str), Some("unload"));
    let lines = lines.lock().unwrap();
    assert!(lines.iter().any(|l| l.contains("mock-2.0.0")));
    assert!(lines.iter().any(|l| l.contains("mock.node")));
}

#[test]
fn vendor_failures_map_to_statuses() {
    let loader = MockLoader::new();
    loader.fail("accel_graph_finalize", 1003);
    let (logger, _) = capture(LogLevel::Error);
    let err = Session::create(SessionConfig::new("libAccelHtp.so", "libmodel.so"), &loader, logger)
        .unwrap_err();
    assert!(matches!(err, Error::Vendor { call: "accel_graph_finalize", .. }));
    assert_eq!(Status::from(&err), Status::SystemError);
    // everything created before the failure is released
    assert!(loader.calls().iter().any(|c| c == "accel_context_free"));
    assert_eq!(loader.calls().last().map(String::as_str), Some("unload"));
}

#[test]
fn sessions_run_on_the_dispatcher() {
    let dispatcher = Dispatcher::new(DispatchConfig {
        workers: 2,
        queue_depth: 2,
    })
    .unwrap();
    let handles: Vec<_> = (1..=3)
        .map(|i| {
            dispatcher
                .submit(move |_| -> Result<Vec<Vec<f32>>, Error> {
                    let loader = MockLoader::new();
                    let logger = Arc::new(Logger::with_tracing(LogLevel::Error));
                    let config = SessionConfig::new("libAccelGpu.so", "libmodel.so");
                    let mut session = Session::create(config, &loader, logger)?;
                    session.load_float_inputs(&[vec![i as f32; 4]], 0)?;
                    session.execute_graphs()?;
                    session.get_float_outputs(0)
                })
                .unwrap()
        })
        .collect();
    let firsts: Vec<f32> = handles
        .into_iter()
        .map(|h| h.wait().unwrap().unwrap()[0][0])
        .collect();
    assert_eq!(firsts, vec![4.0, 8.0, 12.0]);
}
