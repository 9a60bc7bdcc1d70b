//! gRPC adapter: maps wire requests onto backend operations and streams
//! wallet events.
//!
//! The adapter is a thin translation layer. `Init` builds the backend from
//! the raw configuration bytes the host supplies; every other call routes to
//! a wallet (by URL) or to the backend's account-level operations.
//! Configuration problems surface as `InvalidArgument`, everything else as
//! `Internal`.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tonic::{transport::Server, Request, Response, Status};
use tracing::debug;

use crate::account::{Account, Address, WalletUrl};
use crate::backend::Backend;
use crate::config::{PluginConfig, VaultSecretConfig};
use crate::error::Error;
use crate::events::WalletEvent;

pub mod proto {
    tonic::include_proto!("signer");
}

use proto::signer_server::{Signer, SignerServer};

/// Buffered events per live stream before the oldest are dropped.
const EVENT_STREAM_BUFFER: usize = 64;

/// The plugin service. Holds no backend until `Init` provides configuration.
pub struct SignerService {
    backend: RwLock<Option<Arc<Backend>>>,
}

impl Default for SignerService {
    fn default() -> Self {
        Self::new()
    }
}

impl SignerService {
    pub fn new() -> Self {
        Self {
            backend: RwLock::new(None),
        }
    }

    /// Parse, validate and install a backend from raw configuration bytes.
    /// A repeated call replaces the previous backend.
    pub async fn initialize(&self, raw_configuration: &[u8]) -> Result<(), Error> {
        let config = PluginConfig::from_bytes(raw_configuration)?;
        let backend = Backend::new(&config).await?;
        *self.backend.write().expect("backend lock poisoned") = Some(Arc::new(backend));
        Ok(())
    }

    fn backend(&self) -> Result<Arc<Backend>, Status> {
        self.backend
            .read()
            .expect("backend lock poisoned")
            .clone()
            .ok_or_else(|| Status::internal("plugin has not been initialized"))
    }
}

/// Serve the plugin on an already-bound listener until the process ends.
pub async fn serve(
    listener: TcpListener,
    service: SignerService,
) -> Result<(), tonic::transport::Error> {
    Server::builder()
        .add_service(SignerServer::new(service))
        .serve_with_incoming(TcpListenerStream::new(listener))
        .await
}

fn internal(err: Error) -> Status {
    debug!(error = %err, "request failed");
    Status::internal(err.to_string())
}

fn account_from_proto(account: Option<&proto::Account>) -> Result<Account, Status> {
    let account = account.ok_or_else(|| Status::internal("account must be provided"))?;
    let address = if account.address.is_empty() {
        Address::default()
    } else {
        Address::from_slice(&account.address)
            .ok_or_else(|| Status::internal("account address must be 20 bytes"))?
    };
    Ok(Account::new(address, WalletUrl::parse(&account.url)))
}

fn account_to_proto(account: &Account) -> proto::Account {
    proto::Account {
        address: account.address.as_bytes().to_vec(),
        url: account.url.to_string(),
    }
}

fn hash_from_bytes(hash: &[u8]) -> Result<[u8; 32], Status> {
    hash.try_into()
        .map_err(|_| Status::internal("hash must be exactly 32 bytes"))
}

fn secret_config(new_account: Option<proto::NewVaultAccount>) -> Result<(String, VaultSecretConfig), Status> {
    let new_account =
        new_account.ok_or_else(|| Status::internal("new vault account must be provided"))?;
    let secret = VaultSecretConfig {
        secret_engine_path: new_account.secret_engine_path,
        secret_path: new_account.secret_path,
        secret_version: 0,
        auth_id: new_account.auth_id,
        insecure_skip_cas: new_account.insecure_skip_cas,
        cas_value: new_account.cas_value,
    };
    Ok((new_account.vault_address, secret))
}

fn event_to_proto(event: &WalletEvent) -> proto::GetEventStreamResponse {
    use proto::get_event_stream_response::WalletEvent as ProtoEvent;

    let kind = match event {
        WalletEvent::Arrived { .. } => ProtoEvent::WalletArrived,
        WalletEvent::Opened { .. } => ProtoEvent::WalletOpened,
        WalletEvent::Dropped { .. } => ProtoEvent::WalletDropped,
    };
    proto::GetEventStreamResponse {
        wallet_event: kind as i32,
        wallet_url: event.url().to_string(),
    }
}

#[tonic::async_trait]
impl Signer for SignerService {
    async fn init(
        &self,
        request: Request<proto::InitRequest>,
    ) -> Result<Response<proto::InitResponse>, Status> {
        let started = std::time::Instant::now();
        self.initialize(&request.into_inner().raw_configuration)
            .await
            .map_err(|e| Status::invalid_argument(e.to_string()))?;
        debug!(elapsed = ?started.elapsed(), "plugin initialization complete");
        Ok(Response::new(proto::InitResponse {}))
    }

    async fn status(
        &self,
        request: Request<proto::StatusRequest>,
    ) -> Result<Response<proto::StatusResponse>, Status> {
        let request = request.into_inner();
        let wallet = self
            .backend()?
            .wallet(&request.wallet_url)
            .map_err(internal)?;
        Ok(Response::new(proto::StatusResponse {
            status: wallet.status(),
        }))
    }

    async fn open(
        &self,
        request: Request<proto::OpenRequest>,
    ) -> Result<Response<proto::OpenResponse>, Status> {
        let request = request.into_inner();
        let wallet = self
            .backend()?
            .wallet(&request.wallet_url)
            .map_err(internal)?;
        wallet.open(&request.passphrase).await.map_err(internal)?;
        Ok(Response::new(proto::OpenResponse {}))
    }

    async fn close(
        &self,
        request: Request<proto::CloseRequest>,
    ) -> Result<Response<proto::CloseResponse>, Status> {
        let request = request.into_inner();
        let wallet = self
            .backend()?
            .wallet(&request.wallet_url)
            .map_err(internal)?;
        wallet.close().await.map_err(internal)?;
        Ok(Response::new(proto::CloseResponse {}))
    }

    async fn accounts(
        &self,
        request: Request<proto::AccountsRequest>,
    ) -> Result<Response<proto::AccountsResponse>, Status> {
        let request = request.into_inner();
        let wallet = self
            .backend()?
            .wallet(&request.wallet_url)
            .map_err(internal)?;
        let accounts = wallet
            .accounts()
            .map_err(internal)?
            .iter()
            .map(account_to_proto)
            .collect();
        Ok(Response::new(proto::AccountsResponse { accounts }))
    }

    async fn contains(
        &self,
        request: Request<proto::ContainsRequest>,
    ) -> Result<Response<proto::ContainsResponse>, Status> {
        let request = request.into_inner();
        let wallet = self
            .backend()?
            .wallet(&request.wallet_url)
            .map_err(internal)?;
        let account = account_from_proto(request.account.as_ref())?;
        Ok(Response::new(proto::ContainsResponse {
            is_contained: wallet.contains(&account).map_err(internal)?,
        }))
    }

    async fn sign_hash(
        &self,
        request: Request<proto::SignHashRequest>,
    ) -> Result<Response<proto::SignHashResponse>, Status> {
        let request = request.into_inner();
        let wallet = self
            .backend()?
            .wallet(&request.wallet_url)
            .map_err(internal)?;
        let account = account_from_proto(request.account.as_ref())?;
        let hash = hash_from_bytes(&request.hash)?;

        let signature = wallet.sign_hash(&account, &hash).await.map_err(internal)?;
        Ok(Response::new(proto::SignHashResponse {
            result: signature.to_vec(),
        }))
    }

    async fn sign_tx(
        &self,
        request: Request<proto::SignTxRequest>,
    ) -> Result<Response<proto::SignTxResponse>, Status> {
        let request = request.into_inner();
        let wallet = self
            .backend()?
            .wallet(&request.wallet_url)
            .map_err(internal)?;
        let account = account_from_proto(request.account.as_ref())?;

        let signed = wallet
            .sign_tx(&account, &request.rlp_tx, &request.chain_id)
            .await
            .map_err(internal)?;
        Ok(Response::new(proto::SignTxResponse { rlp_tx: signed }))
    }

    async fn sign_hash_with_passphrase(
        &self,
        request: Request<proto::SignHashWithPassphraseRequest>,
    ) -> Result<Response<proto::SignHashResponse>, Status> {
        let request = request.into_inner();
        let wallet = self
            .backend()?
            .wallet(&request.wallet_url)
            .map_err(internal)?;
        let account = account_from_proto(request.account.as_ref())?;
        let hash = hash_from_bytes(&request.hash)?;

        let signature = wallet
            .sign_hash_with_passphrase(&account, &request.passphrase, &hash)
            .await
            .map_err(internal)?;
        Ok(Response::new(proto::SignHashResponse {
            result: signature.to_vec(),
        }))
    }

    async fn sign_tx_with_passphrase(
        &self,
        request: Request<proto::SignTxWithPassphraseRequest>,
    ) -> Result<Response<proto::SignTxResponse>, Status> {
        let request = request.into_inner();
        let wallet = self
            .backend()?
            .wallet(&request.wallet_url)
            .map_err(internal)?;
        let account = account_from_proto(request.account.as_ref())?;

        let signed = wallet
            .sign_tx_with_passphrase(
                &account,
                &request.passphrase,
                &request.rlp_tx,
                &request.chain_id,
            )
            .await
            .map_err(internal)?;
        Ok(Response::new(proto::SignTxResponse { rlp_tx: signed }))
    }

    async fn timed_unlock(
        &self,
        request: Request<proto::TimedUnlockRequest>,
    ) -> Result<Response<proto::TimedUnlockResponse>, Status> {
        let request = request.into_inner();
        let account = account_from_proto(request.account.as_ref())?;
        let duration = Duration::from_nanos(request.duration.max(0) as u64);

        self.backend()?
            .timed_unlock(&account, &request.password, duration)
            .await
            .map_err(internal)?;
        Ok(Response::new(proto::TimedUnlockResponse {}))
    }

    async fn lock(
        &self,
        request: Request<proto::LockRequest>,
    ) -> Result<Response<proto::LockResponse>, Status> {
        let request = request.into_inner();
        let account = account_from_proto(request.account.as_ref())?;

        self.backend()?.lock(&account).await.map_err(internal)?;
        Ok(Response::new(proto::LockResponse {}))
    }

    async fn new_account(
        &self,
        request: Request<proto::NewAccountRequest>,
    ) -> Result<Response<proto::NewAccountResponse>, Status> {
        let request = request.into_inner();
        let (vault_address, secret) = secret_config(request.new_vault_account)?;

        let backend = self.backend()?;
        let creator = backend.account_creator(&vault_address).map_err(internal)?;
        let (account, secret_uri) = creator.new_account(secret).await.map_err(internal)?;

        Ok(Response::new(proto::NewAccountResponse {
            account: Some(account_to_proto(&account)),
            secret_uri,
        }))
    }

    async fn import_raw_key(
        &self,
        request: Request<proto::ImportRawKeyRequest>,
    ) -> Result<Response<proto::ImportRawKeyResponse>, Status> {
        let request = request.into_inner();
        let (vault_address, secret) = secret_config(request.new_vault_account)?;

        let backend = self.backend()?;
        let creator = backend.account_creator(&vault_address).map_err(internal)?;
        let (account, secret_uri) = creator
            .import_raw_key(secret, &request.raw_key)
            .await
            .map_err(internal)?;

        Ok(Response::new(proto::ImportRawKeyResponse {
            account: Some(account_to_proto(&account)),
            secret_uri,
        }))
    }

    type GetEventStreamStream = ReceiverStream<Result<proto::GetEventStreamResponse, Status>>;

    async fn get_event_stream(
        &self,
        _request: Request<proto::GetEventStreamRequest>,
    ) -> Result<Response<Self::GetEventStreamStream>, Status> {
        let backend = self.backend()?;

        // Subscribe before snapshotting so nothing arriving in between is
        // lost; the host tolerates a duplicate arrival.
        let mut subscription = backend.subscribe();
        let wallets = backend.wallets();

        let (tx, rx) = mpsc::channel(EVENT_STREAM_BUFFER);
        tokio::spawn(async move {
            for wallet in wallets {
                let snapshot = proto::GetEventStreamResponse {
                    wallet_event: proto::get_event_stream_response::WalletEvent::WalletArrived
                        as i32,
                    wallet_url: wallet.url_string(),
                };
                if tx.send(Ok(snapshot)).await.is_err() {
                    return;
                }
            }
            while let Some(event) = subscription.recv().await {
                if tx.send(Ok(event_to_proto(&event))).await.is_err() {
                    // Subscriber went away; dropping the subscription
                    // releases it
                    return;
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_account_conversions() {
        let account = Account::new(
            Address([7u8; 20]),
            WalletUrl::parse("file://vault.example:8200/accts/a.json"),
        );
        let wire = account_to_proto(&account);
        assert_eq!(wire.address.len(), 20);
        assert_eq!(wire.url, "file://vault.example:8200/accts/a.json");

        let back = account_from_proto(Some(&wire)).unwrap();
        assert_eq!(back, account);
    }

    #[test]
    fn test_account_with_empty_address() {
        let wire = proto::Account {
            address: vec![],
            url: "file://v:1/a.json".to_string(),
        };
        let account = account_from_proto(Some(&wire)).unwrap();
        assert!(account.address.is_zero());
    }

    #[test]
    fn test_account_rejects_bad_address() {
        let wire = proto::Account {
            address: vec![1, 2, 3],
            url: String::new(),
        };
        assert!(account_from_proto(Some(&wire)).is_err());
    }

    #[test]
    fn test_hash_length_enforced() {
        assert!(hash_from_bytes(&[0u8; 32]).is_ok());
        assert!(hash_from_bytes(&[0u8; 31]).is_err());
        assert!(hash_from_bytes(&[]).is_err());
    }

    #[test]
    fn test_event_conversion() {
        let event = WalletEvent::Dropped {
            url: "file://v:1/a.json".to_string(),
        };
        let wire = event_to_proto(&event);
        assert_eq!(
            wire.wallet_event,
            proto::get_event_stream_response::WalletEvent::WalletDropped as i32
        );
        assert_eq!(wire.wallet_url, "file://v:1/a.json");
    }

    #[tokio::test]
    async fn test_uninitialized_service_reports_internal() {
        let service = SignerService::new();
        let status = service.backend().unwrap_err();
        assert_eq!(status.code(), tonic::Code::Internal);
    }
}
