use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;

use bytes::Bytes;
use log::{debug, error, warn};
use tokio::runtime::Builder;

use tls_socket_adapter::address::NetLocation;
use tls_socket_adapter::buffer_queue::BufferQueue;
use tls_socket_adapter::config::{self, ConnectorConfig, ProxyConfig};
use tls_socket_adapter::connector::TlsConnector;
use tls_socket_adapter::tcp_transport::drive;

struct Options {
    config_path: Option<String>,
    proxy: Option<String>,
    target: String,
    path: String,
}

fn print_usage_and_exit(arg0: String) -> ! {
    eprintln!(
        "Usage: {arg0} [--config/-c FILE] [--proxy/-p HOST:PORT] <host[:port]> [path]"
    );
    std::process::exit(1);
}

fn parse_args() -> Options {
    let mut args: Vec<String> = std::env::args().collect();
    let arg0 = args.remove(0);
    let mut config_path = None;
    let mut proxy = None;

    while !args.is_empty() && args[0].starts_with("-") {
        let flag = args.remove(0);
        if flag == "--config" || flag == "-c" {
            if args.is_empty() {
                eprintln!("Missing config filename.");
                print_usage_and_exit(arg0.clone());
            }
            config_path = Some(args.remove(0));
        } else if flag == "--proxy" || flag == "-p" {
            if args.is_empty() {
                eprintln!("Missing proxy address.");
                print_usage_and_exit(arg0.clone());
            }
            proxy = Some(args.remove(0));
        } else {
            eprintln!("Invalid argument: {flag}");
            print_usage_and_exit(arg0.clone());
        }
    }

    if args.is_empty() || args.len() > 2 {
        print_usage_and_exit(arg0);
    }

    let target = args.remove(0);
    let path = args.pop().unwrap_or_else(|| "/".to_string());
    Options {
        config_path,
        proxy,
        target,
        path,
    }
}

/// Writes and flushes `data`, consuming it only once it is all out.
fn write_response<W: Write>(out: &mut W, data: &mut BufferQueue) -> std::io::Result<()> {
    for chunk in data.iter() {
        out.write_all(chunk)?;
    }
    out.flush()?;
    data.clear();
    Ok(())
}

async fn run(options: Options) -> std::io::Result<()> {
    let mut connector_config = match options.config_path {
        Some(ref path) => config::load_config(path).await?,
        None => ConnectorConfig::default(),
    };
    if let Some(ref proxy) = options.proxy {
        connector_config.proxy = Some(ProxyConfig {
            address: NetLocation::from_str(proxy, None)?,
            username: None,
            password: None,
        });
    }

    let target = NetLocation::from_str(&options.target, Some(443))?;
    let connector = TlsConnector::from_config(&connector_config)?;
    let mut socket = connector.connect(&target).await?;

    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nUser-Agent: tls-socket-adapter\r\nConnection: close\r\n\r\n",
        options.path,
        target.authority()
    );
    let outbound = Rc::new(RefCell::new(BufferQueue::from_bytes(Bytes::from(request))));
    socket.set_writable_callback(move |socket| {
        if socket.is_handshake_complete() {
            socket.write(&mut outbound.borrow_mut());
        }
    });

    socket.set_data_callback(|socket, data| {
        if let Err(e) = write_response(&mut std::io::stdout().lock(), data) {
            error!("Failed to write to stdout: {e}");
            socket.close();
        }
    });

    let failure = Rc::new(RefCell::new(None));
    let failure_sink = failure.clone();
    socket.set_end_callback(move |socket, error| match error {
        Some(error) => {
            *failure_sink.borrow_mut() = Some(error.to_string());
        }
        None => debug!("{:?} closed the connection", socket.host()),
    });

    drive(&mut socket, connector.read_buffer_size()).await?;

    if let Some(chain) = socket.peer_certificate_chain() {
        debug!("peer presented {} certificate(s)", chain.len());
    }
    if !socket.is_handshake_complete() {
        warn!("connection closed before the handshake completed");
    }

    match failure.borrow_mut().take() {
        Some(message) => Err(std::io::Error::other(message)),
        None => Ok(()),
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            let timestamp = buf.timestamp();
            let level_style = buf.default_level_style(record.level());
            let sanitized_args = format!("{}", record.args())
                .chars()
                .map(|c| {
                    if c.is_ascii_graphic() || c == ' ' {
                        c
                    } else {
                        '?'
                    }
                })
                .collect::<String>();

            writeln!(
                buf,
                "[{} {level_style}{}{level_style:#} {}] {}",
                timestamp,
                record.level(),
                record.target(),
                sanitized_args
            )
        })
        .init();

    let options = parse_args();

    let runtime = match Builder::new_current_thread()
        .enable_io()
        .enable_time()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Could not build tokio runtime: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run(options)) {
        error!("{e}");
        std::process::exit(1);
    }
}
