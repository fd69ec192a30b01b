use receipt_usb::{
    Align, CommandBuilder, ConnectionState, Cut, MemoryBus, PrintError, PrintJob, PrinterConfig,
    PrinterService, SimulatedPrinter, Underline, scan,
};
use tokio_util::sync::CancellationToken;

fn receipt() -> receipt_usb::CommandBuffer {
    CommandBuilder::new()
        .init()
        .align(Align::Center)
        .size(2, 2)
        .bold(true)
        .line("MESA 4")
        .bold(false)
        .size(1, 1)
        .align(Align::Left)
        .underline(Underline::Single)
        .line("2x Cafe")
        .underline(Underline::Off)
        .feed(3)
        .cut(Cut::Partial)
        .open_drawer()
        .build()
}

#[test]
fn test_scan_scenario_epson_without_printer_class() {
    let bus = MemoryBus::new();
    bus.attach(SimulatedPrinter::new(0x04b8, 0x0e15, 0));

    let found = scan(&bus).unwrap();
    assert_eq!(found.len(), 1);
    assert!(found[0].is_known_vendor);
    assert_eq!(found[0].vendor_name.as_deref(), Some("Epson"));
    assert!(!found[0].is_printer_class);
}

#[test]
fn test_candidates_serialize_for_host() {
    let bus = MemoryBus::new();
    bus.attach(SimulatedPrinter::new(0x0519, 0x0003, 7));

    let json = serde_json::to_value(scan(&bus).unwrap()).unwrap();
    assert_eq!(json[0]["vendor_name"], "Star Micronics");
    assert_eq!(json[0]["descriptor"]["vendor_id"], 0x0519);
    assert_eq!(json[0]["is_printer_class"], true);
    assert_eq!(json[0]["descriptor"]["interface_class"], 7);
}

#[tokio::test]
async fn test_full_receipt_reaches_device_byte_for_byte() {
    let bus = MemoryBus::new();
    let key = bus.attach(SimulatedPrinter::new(0x04b8, 0x0e15, 0).kernel_driver_bound().max_chunk(8));
    let service = PrinterService::new(bus, PrinterConfig::default());

    let payload = receipt();
    let report = PrintJob::new(payload.clone())
        .run(&service, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.attempts, 1);
    assert_eq!(report.bytes_written, payload.len());
    assert_eq!(service.bus().written(key), payload.as_bytes());

    let tail = &payload[payload.len() - 8..];
    assert_eq!(tail, &[0x1D, 0x56, 0x01, 0x1B, 0x70, 0x00, 0x19, 0xFA]);
}

#[tokio::test]
async fn test_disconnect_after_failure_leaves_closed() {
    let bus = MemoryBus::new();
    bus.attach(SimulatedPrinter::new(0x04b8, 0x0e15, 7).fail_writes([rusb::Error::Io]));
    let config = PrinterConfig {
        retry_transfer: false,
        ..PrinterConfig::default()
    };
    let service = PrinterService::new(bus, config);

    let desc = service.scan().await.unwrap()[0].descriptor;
    let handle = service.connect(desc).await.unwrap();

    let err = service.print(&handle, &receipt()).await.unwrap_err();
    assert_eq!(err.kind(), "TRANSFER");
    assert_eq!(handle.state().await, ConnectionState::Failed);

    service.disconnect(&handle).await;
    assert_eq!(handle.state().await, ConnectionState::Closed);
}

#[tokio::test]
async fn test_permission_denied_surfaces_typed_error() {
    let bus = MemoryBus::new();
    bus.attach(SimulatedPrinter::new(0x04b8, 0x0e15, 7).fail_open(rusb::Error::Access));
    let service = PrinterService::new(bus, PrinterConfig::default());

    let err = PrintJob::new(receipt())
        .run(&service, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, PrintError::PermissionDenied(_)));
    assert_eq!(err.kind(), "PERMISSION");
}

#[tokio::test]
async fn test_independent_devices_print_concurrently() {
    let bus = MemoryBus::new();
    let a = bus.attach(SimulatedPrinter::new(0x04b8, 0x0e15, 7));
    let b = bus.attach(SimulatedPrinter::new(0x0519, 0x0003, 7));
    let service = PrinterService::new(bus, PrinterConfig::default());

    let found = service.scan().await.unwrap();
    let cancel = CancellationToken::new();
    let (ra, rb) = tokio::join!(
        PrintJob::to_device(found[0].descriptor, receipt()).run(&service, &cancel),
        PrintJob::to_device(found[1].descriptor, receipt()).run(&service, &cancel),
    );

    assert!(ra.is_ok());
    assert!(rb.is_ok());
    assert_eq!(service.bus().written(a), receipt().as_bytes());
    assert_eq!(service.bus().written(b), receipt().as_bytes());
}
