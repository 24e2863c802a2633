//! One-shot client used by `--reset-password`: connects to the agent running
//! on this host, authenticates with the local secret and clears the password.

use anyhow::{anyhow, bail, Context, Result};
use futures::{SinkExt, StreamExt};
use rmpv::Value;
use rustls::pki_types::ServerName;
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_util::codec::Framed;

use crate::cert;
use crate::dispatcher::CMD_SET_PASSWORD;
use crate::paths;
use crate::property::GROUP_NONE;
use crate::protocol::{decode_message, encode_message, FrameCodec, ResponseCode, CMD_AUTH, CMD_COMMAND, CMD_RESPONSE};
use crate::secret::LocalSecret;

pub const RESET_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn reset_password(data_dir: &Path, port: u16) -> Result<()> {
    let secret = LocalSecret::read(&paths::secret_file_path(data_dir))
        .context("Is the agent running on this host?")?;
    let material = cert::load_or_generate(
        &paths::cert_file_path(data_dir),
        &paths::key_file_path(data_dir),
        "localhost",
    )?;
    let connector = TlsConnector::from(cert::client_config(&material)?);

    timeout(RESET_TIMEOUT, async {
        let tcp = TcpStream::connect(("127.0.0.1", port))
            .await
            .with_context(|| format!("Failed to connect to the agent on port {port}"))?;
        let name = ServerName::try_from("localhost").map_err(|e| anyhow!("invalid server name: {e}"))?;
        let stream = connector.connect(name, tcp).await.context("TLS handshake failed")?;
        clear_password(stream, &secret).await
    })
    .await
    .map_err(|_| anyhow!("No response from the agent within {}s", RESET_TIMEOUT.as_secs()))?
}

async fn receive<S>(framed: &mut Framed<S, FrameCodec>) -> Result<Vec<Value>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let payload = framed
        .next()
        .await
        .ok_or_else(|| anyhow!("the agent closed the connection"))??;
    Ok(decode_message(&payload)?)
}

/// Authenticates with `secret` and sends an empty `setPassword`.
pub async fn clear_password<S>(stream: S, secret: &LocalSecret) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(stream, FrameCodec::new());
    framed
        .send(encode_message(vec![
            CMD_AUTH.into(),
            env!("CARGO_PKG_VERSION").into(),
            crate::global_manager::host_name().into(),
            secret.as_str().into(),
            false.into(),
        ]))
        .await?;
    let reply = receive(&mut framed).await?;
    if reply.first().and_then(Value::as_str) != Some(CMD_AUTH) || reply.get(1).and_then(Value::as_i64) != Some(1) {
        bail!("authentication with the local secret was rejected");
    }

    framed
        .send(encode_message(vec![
            CMD_COMMAND.into(),
            GROUP_NONE.into(),
            CMD_SET_PASSWORD.into(),
            "".into(),
        ]))
        .await?;
    loop {
        let reply = receive(&mut framed).await?;
        let is_response = reply.first().and_then(Value::as_str) == Some(CMD_RESPONSE)
            && reply.get(2).and_then(Value::as_str) == Some(CMD_SET_PASSWORD);
        if !is_response {
            continue;
        }
        let code = reply.get(3).and_then(Value::as_i64).and_then(ResponseCode::from_wire);
        return match code {
            Some(ResponseCode::Success) => Ok(()),
            other => Err(anyhow!("the agent refused the password reset ({other:?})")),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn secret() -> (tempfile::TempDir, LocalSecret) {
        let dir = tempfile::tempdir().unwrap();
        let secret = LocalSecret::generate(&dir.path().join("local.secret")).unwrap();
        (dir, secret)
    }

    async fn recv(agent: &mut Framed<tokio::io::DuplexStream, FrameCodec>) -> Vec<Value> {
        decode_message(&agent.next().await.unwrap().unwrap()).unwrap()
    }

    async fn reply(agent: &mut Framed<tokio::io::DuplexStream, FrameCodec>, items: Vec<Value>) {
        let bytes: Bytes = encode_message(items);
        agent.send(bytes).await.unwrap();
    }

    #[tokio::test]
    async fn sends_secret_then_empty_password() {
        let (_dir, secret) = secret();
        let (client_io, agent_io) = tokio::io::duplex(4096);
        let expected = secret.as_str().to_string();

        let agent = tokio::spawn(async move {
            let mut agent = Framed::new(agent_io, FrameCodec::new());
            let auth = recv(&mut agent).await;
            assert_eq!(auth[0], Value::from("aut"));
            assert_eq!(auth[3], Value::from(expected.as_str()));
            assert_eq!(auth[4], Value::from(false));
            reply(&mut agent, vec!["aut".into(), 1.into(), "h".into(), "v".into(), "id".into()]).await;

            let cmd = recv(&mut agent).await;
            assert_eq!(
                cmd,
                vec![Value::from("cmd"), Value::from(""), Value::from("setPassword"), Value::from("")]
            );
            // Unrelated traffic before the response is skipped.
            reply(&mut agent, vec!["log".into(), 3.into(), "hi".into()]).await;
            reply(&mut agent, vec!["rsp".into(), "".into(), "setPassword".into(), 0.into()]).await;
        });

        clear_password(client_io, &secret).await.unwrap();
        agent.await.unwrap();
    }

    #[tokio::test]
    async fn rejected_auth_is_an_error() {
        let (_dir, secret) = secret();
        let (client_io, agent_io) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            let mut agent = Framed::new(agent_io, FrameCodec::new());
            let _ = recv(&mut agent).await;
            reply(&mut agent, vec!["aut".into(), 0.into(), "Password error".into()]).await;
        });
        assert!(clear_password(client_io, &secret).await.is_err());
    }

    #[tokio::test]
    async fn error_response_is_an_error() {
        let (_dir, secret) = secret();
        let (client_io, agent_io) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            let mut agent = Framed::new(agent_io, FrameCodec::new());
            let _ = recv(&mut agent).await;
            reply(&mut agent, vec!["aut".into(), 1.into(), "h".into(), "v".into(), "id".into()]).await;
            let _ = recv(&mut agent).await;
            reply(&mut agent, vec!["rsp".into(), "".into(), "setPassword".into(), 1.into()]).await;
        });
        assert!(clear_password(client_io, &secret).await.is_err());
    }
}
