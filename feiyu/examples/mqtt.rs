// Copyright (c) 2023 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use feiyu::{AsyncClient, ConnectOptions, QoS};

#[tokio::main]
async fn main() -> Result<(), feiyu::Error> {
    std::env::set_var("RUST_LOG", "info");
    env_logger::init();

    let options = ConnectOptions::new("127.0.0.1:1883");
    log::info!("options: {:?}", options);

    let mut client = AsyncClient::new(options);
    let session_present = client.connect().await?;
    log::info!("connected, session present: {session_present}");

    client.subscribe("hello", QoS::AtMostOnce).await?;
    client
        .publish("hello", QoS::AtMostOnce, false, b"Hello, world")
        .await?;

    while let Some(message) = client.next_message().await {
        log::info!(
            "[{}] {:?}",
            message.topic(),
            String::from_utf8_lossy(message.message())
        );
    }

    Ok(())
}
