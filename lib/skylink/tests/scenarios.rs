//! End-to-end scenarios against a scripted serial port: full radio
//! dialogues, ordering and backpressure properties, and failure modes.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::unbounded;

use common::{feed_wifi_up, test_device, wait_until, Expect, ScriptedPort};
use skylink::config::RECEIVE_QUEUE_LEN;
use skylink::netconn::Netconn;
use skylink::prelude::*;
use skylink::{ConnEvent, ConnEvtFn};

fn recording_hook() -> (ConnEvtFn, crossbeam_channel::Receiver<String>) {
    let (tx, rx) = unbounded();
    let hook: ConnEvtFn = Arc::new(move |event| {
        let desc = match event {
            ConnEvent::Active { client, .. } => format!("active client={}", client),
            ConnEvent::Recv { pbuf, .. } => {
                format!("recv {}", String::from_utf8_lossy(&pbuf.to_vec()))
            }
            ConnEvent::Closed { forced, .. } => format!("closed forced={}", forced),
        };
        let _ = tx.send(desc);
        EvtReply::Ok
    });
    (hook, rx)
}

#[test]
fn test_initialize_applies_baseline_and_version_gate() {
    let port = ScriptedPort::new();
    port.expect(Expect::Prefix(b"AT+RST"), b"OK\r\n\r\nready\r\n");
    port.expect(Expect::Prefix(b"ATE0"), b"OK\r\n");
    port.expect(Expect::Prefix(b"AT+CWMODE=1"), b"OK\r\n");
    port.expect(Expect::Prefix(b"AT+CIPMUX=1"), b"OK\r\n");
    port.expect(Expect::Prefix(b"AT+CIPDINFO=1"), b"OK\r\n");
    port.expect(
        Expect::Prefix(b"AT+GMR"),
        b"AT version:2.2.0.0(s-ec2dec2)\r\nSDK version:v4.2.2-76-gefa6eca\r\nOK\r\n",
    );

    let device = test_device(&port);
    device.initialize().unwrap();

    assert_eq!(device.at_version().unwrap().to_string(), "2.2.0");
    assert!(device.at_version_supported());
    assert!(port.written_contains(b"AT+CWMODE=1\r\n"));
    assert!(port.written_contains(b"AT+CIPDINFO=1\r\n"));
}

#[test]
fn test_scenario_join_connect_send_receive_close() {
    let port = ScriptedPort::new();
    port.expect(
        Expect::Prefix(b"AT+CWJAP=\"foo\",\"bar\""),
        b"WIFI CONNECTED\r\nWIFI GOT IP\r\n\r\nOK\r\n",
    );
    port.expect(
        Expect::Prefix(b"AT+CIPSTART=0,\"TCP\",\"example.com\",80"),
        b"0,CONNECT\r\n\r\nOK\r\n",
    );
    port.expect(Expect::Prefix(b"AT+CIPSEND=0,77"), b"OK\r\n> ");
    port.expect(Expect::Any, b"Recv 77 bytes\r\n\r\nSEND OK\r\n");

    let device = test_device(&port);
    let (hook, events) = recording_hook();

    device.sta_join("foo", Some("bar"), None).unwrap();
    assert!(device.is_wifi_connected());
    assert!(device.has_ip());

    let conn = device
        .conn_start(
            ConnType::Tcp,
            "example.com",
            80,
            ConnStartOptions::default(),
            Some(hook),
        )
        .unwrap();
    assert_eq!(conn.index(), 0);
    assert_eq!(
        events.recv_timeout(Duration::from_secs(1)).unwrap(),
        "active client=true"
    );

    let request = vec![b'x'; 77];
    assert_eq!(device.conn_send(conn, &request).unwrap(), 77);
    assert_eq!(device.conn_totals(conn), Some((0, 77)));

    device.input_process(b"\r\n+IPD,0,13:Hello, World!");
    assert_eq!(
        events.recv_timeout(Duration::from_secs(1)).unwrap(),
        "recv Hello, World!"
    );
    assert_eq!(device.conn_totals(conn), Some((13, 77)));

    device.input_process(b"0,CLOSED\r\n");
    assert_eq!(
        events.recv_timeout(Duration::from_secs(1)).unwrap(),
        "closed forced=false"
    );
    assert!(!device.conn_is_active(conn));
}

#[test]
fn test_scenario_back_to_back_ipd_packets() {
    let port = ScriptedPort::new();
    port.expect(
        Expect::Prefix(b"AT+CIPSTART=0"),
        b"0,CONNECT\r\n\r\nOK\r\n",
    );

    let device = test_device(&port);
    feed_wifi_up(&device);
    let (hook, events) = recording_hook();

    device
        .conn_start(
            ConnType::Tcp,
            "10.0.0.2",
            9000,
            ConnStartOptions::default(),
            Some(hook),
        )
        .unwrap();
    assert_eq!(
        events.recv_timeout(Duration::from_secs(1)).unwrap(),
        "active client=true"
    );

    // Two packets glued together in one chunk, no separator between them.
    device.input_process(b"+IPD,0,5:HELLO+IPD,0,3:ABC");

    assert_eq!(
        events.recv_timeout(Duration::from_secs(1)).unwrap(),
        "recv HELLO"
    );
    assert_eq!(
        events.recv_timeout(Duration::from_secs(1)).unwrap(),
        "recv ABC"
    );
    assert!(events.try_recv().is_err());
}

#[test]
fn test_scenario_ipd_split_across_arbitrary_chunks() {
    let port = ScriptedPort::new();
    port.expect(
        Expect::Prefix(b"AT+CIPSTART=0"),
        b"0,CONNECT\r\n\r\nOK\r\n",
    );

    let device = test_device(&port);
    feed_wifi_up(&device);
    let (hook, events) = recording_hook();

    device
        .conn_start(
            ConnType::Tcp,
            "10.0.0.2",
            9000,
            ConnStartOptions::default(),
            Some(hook),
        )
        .unwrap();
    events.recv_timeout(Duration::from_secs(1)).unwrap();

    // Byte-at-a-time delivery must still produce one coherent payload.
    for &byte in b"+IPD,0,10:0123456789".iter() {
        device.input_process(&[byte]);
    }

    assert_eq!(
        events.recv_timeout(Duration::from_secs(1)).unwrap(),
        "recv 0123456789"
    );
}

#[test]
fn test_scenario_command_timeout_then_recovery() {
    let port = ScriptedPort::new();
    // No reply scripted for the first probe: it must time out.

    let device = test_device(&port);
    let err = device.probe().unwrap_err();
    assert_eq!(err, DriverError::Timeout);

    // The producer must be back to servicing the queue.
    port.expect(Expect::Prefix(b"AT\r\n"), b"OK\r\n");
    device.probe().unwrap();
}

#[test]
fn test_property_one_outstanding_command_and_completion_order() {
    let port = ScriptedPort::new();
    let device = test_device(&port);

    let order = Arc::new(std::sync::Mutex::new(Vec::new()));

    let order_a = order.clone();
    device
        .sta_quit_nb(move |result| {
            result.unwrap();
            order_a.lock().unwrap().push("first");
        })
        .unwrap();
    let order_b = order.clone();
    device
        .sta_quit_nb(move |result| {
            result.unwrap();
            order_b.lock().unwrap().push("second");
        })
        .unwrap();

    // Only the first command may touch the UART until its terminator lands.
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(port.write_count(), 1);

    device.input_process(b"OK\r\n");
    assert!(wait_until(Duration::from_secs(1), || port.write_count() == 2));
    device.input_process(b"OK\r\n");

    assert!(wait_until(Duration::from_secs(1), || {
        order.lock().unwrap().len() == 2
    }));
    assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
}

#[test]
fn test_property_receive_mailbox_backpressure() {
    let port = ScriptedPort::new();
    port.expect(
        Expect::Prefix(b"AT+CIPSTART=0"),
        b"0,CONNECT\r\n\r\nOK\r\n",
    );

    let device = test_device(&port);
    feed_wifi_up(&device);

    let nc = Netconn::new(&device, ConnType::Tcp);
    nc.connect("10.0.0.2", 9000).unwrap();
    let conn = nc.conn().unwrap();

    // Flood with more packets than the mailbox admits, before any read.
    let flood = RECEIVE_QUEUE_LEN + 8;
    let mut bytes = Vec::new();
    for _ in 0..flood {
        bytes.extend_from_slice(b"+IPD,0,1:x");
    }
    device.input_process(&bytes);

    // All payload bytes were parsed, even the refused ones.
    assert!(wait_until(Duration::from_secs(2), || {
        device.conn_totals(conn) == Some((flood as u64, 0))
    }));

    // Exactly capacity-minus-one packets were queued; the rest were dropped
    // with the reserve slot kept for the close sentinel.
    nc.set_receive_timeout(Some(50));
    let mut delivered = 0;
    loop {
        match nc.receive() {
            Ok(pbuf) => {
                assert_eq!(pbuf.total_len(), 1);
                delivered += 1;
            }
            Err(DriverError::Timeout) => break,
            Err(err) => panic!("Unexpected receive error {:?}", err),
        }
    }
    assert_eq!(delivered, RECEIVE_QUEUE_LEN - 1);
}

#[test]
fn test_scenario_netconn_receive_then_remote_close() {
    let port = ScriptedPort::new();
    port.expect(
        Expect::Prefix(b"AT+CIPSTART=0"),
        b"0,CONNECT\r\n\r\nOK\r\n",
    );

    let device = test_device(&port);
    feed_wifi_up(&device);

    let nc = Netconn::new(&device, ConnType::Tcp);
    nc.connect("example.com", 80).unwrap();

    device.input_process(b"+IPD,0,13:Hello, World!0,CLOSED\r\n");

    let pbuf = nc.receive().unwrap();
    assert_eq!(pbuf.to_vec(), b"Hello, World!");
    assert_eq!(nc.receive().unwrap_err(), DriverError::Closed);
}

#[test]
fn test_property_netconn_close_is_idempotent() {
    let port = ScriptedPort::new();
    port.expect(
        Expect::Prefix(b"AT+CIPSTART=0"),
        b"0,CONNECT\r\n\r\nOK\r\n",
    );
    port.expect(Expect::Prefix(b"AT+CIPCLOSE=0"), b"0,CLOSED\r\n\r\nOK\r\n");

    let device = test_device(&port);
    feed_wifi_up(&device);

    let nc = Netconn::new(&device, ConnType::Tcp);
    nc.connect("example.com", 80).unwrap();

    nc.close().unwrap();
    nc.close().unwrap();
}

#[test]
fn test_scenario_server_accept_and_overflow() {
    let port = ScriptedPort::new();
    port.expect(Expect::Prefix(b"AT+CIPSERVERMAXCONN=5"), b"OK\r\n");
    port.expect(Expect::Prefix(b"AT+CIPSERVER=1,80"), b"OK\r\n");
    port.expect(Expect::Prefix(b"AT+CIPSTO=15"), b"OK\r\n");
    port.expect(Expect::Prefix(b"AT+CIPCLOSE=0"), b"OK\r\n");

    let device = test_device(&port);
    feed_wifi_up(&device);

    let server = Netconn::new(&device, ConnType::Tcp);
    server.bind(80).unwrap();
    server.set_listen_conn_timeout(15);
    server.listen().unwrap();

    // Fill every slot (and exactly the accept queue) with inbound clients.
    for n in 0..5u8 {
        let line = format!(
            "+LINK_CONN:0,{},\"TCP\",1,\"10.0.0.9\",5100{},80\r\n",
            n, n
        );
        device.input_process(line.as_bytes());
    }

    // Slot 0 churns: its client vanishes and a new one lands before anyone
    // called accept. The accept queue is full, so the engine must refuse it.
    device.input_process(b"0,CLOSED\r\n");
    device.input_process(b"+LINK_CONN:0,0,\"TCP\",1,\"10.0.0.9\",51009,80\r\n");

    assert!(wait_until(Duration::from_secs(2), || {
        port.written_contains(b"AT+CIPCLOSE=0\r\n")
    }));

    // The mailbox yields exactly the clients that fit.
    for _ in 0..5 {
        let client = server.accept().unwrap();
        assert_eq!(client.kind(), ConnType::Tcp);
    }
}

#[test]
fn test_scenario_device_loss_wakes_receiver_and_blocks_api() {
    let port = ScriptedPort::new();
    port.expect(
        Expect::Prefix(b"AT+CIPSTART=0"),
        b"0,CONNECT\r\n\r\nOK\r\n",
    );

    let device = test_device(&port);
    feed_wifi_up(&device);

    let nc = Netconn::new(&device, ConnType::Tcp);
    nc.connect("example.com", 80).unwrap();

    // Blocking receive on a dedicated consumer thread.
    let receiver = std::thread::spawn(move || nc.receive());

    std::thread::sleep(Duration::from_millis(50));
    let writes_before = port.write_count();
    device.set_present(false);

    let received = receiver.join().unwrap();
    assert_eq!(received.unwrap_err(), DriverError::NoDevice);

    // New work is refused without touching the UART.
    assert_eq!(device.probe().unwrap_err(), DriverError::NoDevice);
    assert_eq!(port.write_count(), writes_before);
}

#[test]
fn test_netconn_write_stages_until_flush() {
    let port = ScriptedPort::new();
    port.expect(
        Expect::Prefix(b"AT+CIPSTART=0"),
        b"0,CONNECT\r\n\r\nOK\r\n",
    );
    port.expect(Expect::Prefix(b"AT+CIPSEND=0,11"), b"OK\r\n> ");
    port.expect(Expect::Any, b"Recv 11 bytes\r\n\r\nSEND OK\r\n");

    let device = test_device(&port);
    feed_wifi_up(&device);

    let nc = Netconn::new(&device, ConnType::Tcp);
    nc.connect("example.com", 80).unwrap();

    // Small writes stage locally; nothing hits the UART yet.
    let writes_before = port.write_count();
    nc.write(b"hello ").unwrap();
    nc.write(b"world").unwrap();
    assert_eq!(port.write_count(), writes_before);

    nc.flush().unwrap();
    assert!(port.written_contains(b"AT+CIPSEND=0,11\r\n"));
    assert!(port.written_contains(b"hello world"));
}

#[test]
fn test_flash_alignment_validated_without_uart_traffic() {
    let port = ScriptedPort::new();
    let device = test_device(&port);

    use skylink::types::FlashPartition;

    assert_eq!(
        device
            .flash_erase(FlashPartition::ClientCert, 0x800, 0x1000)
            .unwrap_err(),
        DriverError::Argument
    );
    assert_eq!(
        device
            .flash_write(FlashPartition::ClientKey, 2, &[0u8; 8])
            .unwrap_err(),
        DriverError::Argument
    );
    assert_eq!(
        device
            .flash_write(FlashPartition::ClientKey, 0, &[0u8; 6])
            .unwrap_err(),
        DriverError::Argument
    );
    assert_eq!(port.write_count(), 0);
}

#[test]
fn test_keepalive_tick_fires() {
    let port = ScriptedPort::new();
    let mut opts = Options::default();
    opts.keepalive_interval_ms = Some(30);
    let device = Device::new(Box::new(port.clone()), opts, None);
    port.attach(device.input_feeder());

    let ticks = Arc::new(AtomicUsize::new(0));
    let ticks_cb = ticks.clone();
    device.register_event(Arc::new(move |event| {
        if matches!(event, Event::KeepAlive) {
            ticks_cb.fetch_add(1, Ordering::SeqCst);
        }
    }));

    assert!(wait_until(Duration::from_secs(2), || {
        ticks.load(Ordering::SeqCst) >= 2
    }));
}

#[test]
fn test_manual_receive_pulls_announced_data() {
    let port = ScriptedPort::new();
    port.expect(Expect::Prefix(b"AT+RST"), b"OK\r\n\r\nready\r\n");
    port.expect(Expect::Prefix(b"ATE0"), b"OK\r\n");
    port.expect(Expect::Prefix(b"AT+CWMODE=1"), b"OK\r\n");
    port.expect(Expect::Prefix(b"AT+CIPMUX=1"), b"OK\r\n");
    port.expect(Expect::Prefix(b"AT+CIPDINFO=1"), b"OK\r\n");
    port.expect(Expect::Prefix(b"AT+CIPRECVMODE=1"), b"OK\r\n");
    port.expect(Expect::Prefix(b"AT+GMR"), b"AT version:2.2.0.0(x)\r\nOK\r\n");
    port.expect(
        Expect::Prefix(b"AT+CIPSTART=0"),
        b"0,CONNECT\r\n\r\nOK\r\n",
    );
    port.expect(
        Expect::Prefix(b"AT+CIPRECVDATA=0,5"),
        b"+CIPRECVDATA,5:HELLO\r\nOK\r\n",
    );

    let mut opts = Options::default();
    opts.manual_tcp_receive = true;
    opts.timeouts.generic_ms = 500;
    opts.timeouts.connect_ms = 500;
    opts.timeouts.reset_ms = 500;
    let device = Device::new(Box::new(port.clone()), opts, None);
    port.attach(device.input_feeder());

    device.initialize().unwrap();
    feed_wifi_up(&device);

    let nc = Netconn::new(&device, ConnType::Tcp);
    nc.connect("example.com", 80).unwrap();

    // Notification-only IPD: the engine must fetch the bytes itself.
    device.input_process(b"+IPD,0,5\r\n");

    nc.set_receive_timeout(Some(1_000));
    let pbuf = nc.receive().unwrap();
    assert_eq!(pbuf.to_vec(), b"HELLO");
    assert!(port.written_contains(b"AT+CIPRECVDATA=0,5\r\n"));
}

#[test]
fn test_udp_sendto_targets_explicit_endpoint() {
    let port = ScriptedPort::new();
    port.expect(
        Expect::Prefix(b"AT+CIPSTART=0,\"UDP\""),
        b"0,CONNECT\r\n\r\nOK\r\n",
    );
    port.expect(
        Expect::Prefix(b"AT+CIPSEND=0,3,\"10.0.0.1\",9000"),
        b"OK\r\n> ",
    );
    port.expect(Expect::Any, b"SEND OK\r\n");

    let device = test_device(&port);
    feed_wifi_up(&device);

    let nc = Netconn::new(&device, ConnType::Udp);
    nc.connect("10.0.0.2", 9000).unwrap();

    assert_eq!(nc.sendto(Ip::V4([10, 0, 0, 1]), 9000, b"abc").unwrap(), 3);

    // Datagrams never get split, so oversized input is refused outright.
    let oversized = vec![0u8; skylink::config::CONN_MAX_DATA_LEN + 1];
    assert_eq!(
        nc.send(&oversized).unwrap_err(),
        DriverError::Argument
    );
}

#[test]
fn test_station_manager_prefers_order_and_falls_through() {
    use skylink::station::{KnownAp, ReconnectPolicy, StationManager};

    let port = ScriptedPort::new();
    port.expect(
        Expect::Prefix(b"AT+CWLAP"),
        b"+CWLAP:(3,\"backup\",-50,\"62:01:94:c1:30:55\",11,0,0,0,0,0,0,0,4,0)\r\n\
          +CWLAP:(3,\"primary\",-70,\"a4:cf:12:0f:9d:1b\",6,0,0,0,0,0,0,0,4,0)\r\nOK\r\n",
    );
    // The preferred network refuses the join; the manager must move on.
    port.expect(Expect::Prefix(b"AT+CWJAP=\"primary\""), b"FAIL\r\n");
    port.expect(
        Expect::Prefix(b"AT+CWJAP=\"backup\""),
        b"WIFI CONNECTED\r\nWIFI GOT IP\r\n\r\nOK\r\n",
    );
    port.expect(Expect::Prefix(b"AT+CWRECONNCFG=30,0"), b"OK\r\n");

    let device = test_device(&port);

    let mut manager = StationManager::new(&device, None);
    manager.add_known(KnownAp::new("primary", Some("hunter2")));
    manager.add_known(KnownAp::new("backup", Some("hunter3")));
    manager.add_known(KnownAp::new("never-seen", None));
    manager.set_reconnect_policy(Some(ReconnectPolicy {
        interval_s: 30,
        repeat: 0,
    }));

    assert_eq!(manager.connect_preferred().unwrap(), "backup");
    assert!(device.has_ip());

    // Already associated: no further scan traffic.
    let writes_before = port.write_count();
    manager.ensure_connected().unwrap();
    assert_eq!(port.write_count(), writes_before);
}

#[test]
fn test_ifconfig_reports_both_interfaces() {
    let port = ScriptedPort::new();
    port.expect(
        Expect::Prefix(b"AT+CIFSR"),
        b"+CIFSR:APIP,\"192.168.4.1\"\r\n+CIFSR:APMAC,\"62:01:94:c1:30:55\"\r\n\
          +CIFSR:STAIP,\"192.168.1.7\"\r\n+CIFSR:STAMAC,\"a4:cf:12:0f:9d:1b\"\r\nOK\r\n",
    );

    let device = test_device(&port);
    let (sta, ap) = device.ifconfig().unwrap();

    assert_eq!(sta.ip, Some(Ip::V4([192, 168, 1, 7])));
    assert_eq!(ap.ip, Some(Ip::V4([192, 168, 4, 1])));
    assert!(sta.mac.is_some());
    assert!(ap.mac.is_some());
}

#[test]
fn test_dns_and_ping_require_network() {
    let port = ScriptedPort::new();
    let device = test_device(&port);

    assert_eq!(
        device.dns_lookup("example.com").unwrap_err(),
        DriverError::WifiNotConnected
    );
    assert_eq!(
        device.ping("example.com").unwrap_err(),
        DriverError::WifiNotConnected
    );

    feed_wifi_up(&device);
    port.expect(
        Expect::Prefix(b"AT+CIPDOMAIN=\"example.com\""),
        b"+CIPDOMAIN:\"93.184.216.34\"\r\nOK\r\n",
    );
    port.expect(Expect::Prefix(b"AT+PING=\"example.com\""), b"+time:23\r\nOK\r\n");

    assert_eq!(
        device.dns_lookup("example.com").unwrap(),
        Ip::V4([93, 184, 216, 34])
    );
    assert_eq!(device.ping("example.com").unwrap(), 23);
}
