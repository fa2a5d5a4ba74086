#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]

use std::env;

use actix_web::App;
use burrow_server::{api, ws, CredentialStore, HubServer, ServerConfig};

fn main() -> Result<(), std::io::Error> {
    let service_port = {
        let args: Vec<String> = env::args().collect();

        if args.len() > 1 {
            args[1].parse::<u16>().expect("Invalid port argument")
        } else {
            env::var("PORT")
                .ok()
                .map_or(Ok(8080), |port| port.parse::<u16>())
                .expect("Invalid PORT environment variable")
        }
    };

    let config = ServerConfig::new(service_port);

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.log_level.as_ref()),
    )
    .init();

    let credentials = CredentialStore::new();
    for entry in env::var("BURROW_USERS")
        .unwrap_or_default()
        .split(',')
        .filter(|entry| !entry.is_empty())
    {
        match entry.split_once(':') {
            Some((name, token)) => credentials.set_user(name.trim(), token.trim()),
            None => log::warn!("Ignoring malformed BURROW_USERS entry '{entry}'"),
        }
    }

    actix_web::rt::System::with_tokio_rt(|| {
        tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .unwrap()
    })
    .block_on(async move {
        let hub = HubServer::new(config.clone(), credentials)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
        let (handle, hub_join) = hub.start();

        let app_handle = handle.clone();
        let http_server = actix_web::HttpServer::new(move || {
            App::new()
                .app_data(actix_web::web::Data::new(app_handle.clone()))
                .service(api::health_endpoint)
                .service(ws::api::websocket)
        })
        .bind((
            env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0".to_string()),
            config.port,
        ))?
        .run();

        let server_handle = http_server.handle();
        let shutdown_hub = handle.clone();
        actix_web::rt::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::info!("Received shutdown signal");
                shutdown_hub
                    .graceful_shutdown(Some("Server shutting down".to_string()))
                    .await;
                server_handle.stop(true).await;
            }
        });

        let resp = http_server.await;

        log::debug!("Shutting down hub actor...");
        handle.shutdown();
        if let Err(err) = hub_join.await {
            log::error!("Hub actor task failed: {err:?}");
        }

        log::debug!("Server shut down");

        resp
    })
}
