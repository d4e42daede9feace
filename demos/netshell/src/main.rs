//! Demonstration programs against the in-process radio simulator.
//!
//! Usage: `netshell <client|server|scan>`

mod sim;

use std::time::Duration;

use flint::logging::{self, info};
use skylink::netconn::Netconn;
use skylink::prelude::*;

use sim::SimRadio;

fn main() {
    let log = logging::init();

    let mode = std::env::args().nth(1).unwrap_or_else(|| "client".into());

    let radio = SimRadio::new();
    let device = Device::new(Box::new(radio.clone()), Options::default(), &log);
    radio.attach(device.input_feeder());

    device.initialize().expect("Radio initialization failed");
    info!(log, "radio up"; "at_version" => device.at_version().map(|v| v.to_string()).unwrap_or_default());

    match mode.as_str() {
        "server" => run_server(&log, &device, &radio),
        "scan" => run_scan(&log, &device),
        _ => run_client(&log, &device),
    }
}

/// Join, connect, send a request, read the echoed reply, close.
fn run_client(log: &logging::Logger, device: &Device) {
    device
        .sta_join("simnet", Some("password"), None)
        .expect("Join failed");
    info!(log, "joined access point");

    let nc = Netconn::new(device, ConnType::Tcp);
    nc.connect("example.com", 80).expect("Connect failed");
    info!(log, "connected"; "conn" => nc.conn_number());

    nc.write(b"GET /hello HTTP/1.1\r\nHost: example.com\r\n\r\n")
        .expect("Write failed");
    nc.flush().expect("Flush failed");

    nc.set_receive_timeout(Some(2_000));
    match nc.receive() {
        Ok(pbuf) => {
            info!(log, "reply received";
                  "len" => pbuf.total_len(),
                  "body" => String::from_utf8_lossy(&pbuf.to_vec()).into_owned());
        }
        Err(err) => info!(log, "receive failed"; "err" => %err),
    }

    nc.close().expect("Close failed");
    info!(log, "connection closed");
}

/// Listen, accept one simulated client, echo its first packet back.
fn run_server(log: &logging::Logger, device: &Device, radio: &SimRadio) {
    device
        .sta_join("simnet", Some("password"), None)
        .expect("Join failed");

    let server = Netconn::new(device, ConnType::Tcp);
    server.bind(80).expect("Bind failed");
    server.set_listen_conn_timeout(10);
    server.listen().expect("Listen failed");
    info!(log, "listening"; "port" => 80);

    // Simulate a client arriving with a request.
    radio.inject_inbound(0, "10.0.0.9", 51842);
    std::thread::sleep(Duration::from_millis(50));
    radio.inject_data(0, b"ping over tcp");

    let client = server.accept().expect("Accept failed");
    info!(log, "client accepted"; "conn" => client.conn_number());

    client.set_receive_timeout(Some(2_000));
    match client.receive() {
        Ok(pbuf) => {
            info!(log, "request"; "body" => String::from_utf8_lossy(&pbuf.to_vec()).into_owned());
            client.write(&pbuf.to_vec()).expect("Write failed");
            client.flush().expect("Flush failed");
        }
        Err(err) => info!(log, "receive failed"; "err" => %err),
    }

    client.close().expect("Close failed");
    server.close().expect("Server close failed");
    info!(log, "server stopped");
}

/// List access points and joined stations.
fn run_scan(log: &logging::Logger, device: &Device) {
    for ap in device.sta_scan(None).expect("Scan failed") {
        info!(log, "access point";
              "ssid" => ap.ssid,
              "rssi" => ap.rssi,
              "channel" => ap.channel,
              "mac" => ap.mac.to_string());
    }

    device
        .sta_join("simnet", Some("password"), None)
        .expect("Join failed");
    info!(log, "ping"; "time_ms" => device.ping("example.com").expect("Ping failed"));
    info!(log, "dns"; "ip" => device.dns_lookup("example.com").expect("Lookup failed").to_string());
}
