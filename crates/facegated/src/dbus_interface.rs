//! D-Bus interface for the facegate identity daemon.
//!
//! Bus name: org.facegate.Identity1
//! Object path: /org/facegate/Identity1
//!
//! Images travel as raw encoded bytes (`ay`); structured replies are JSON.
//! `Verify` and `EnrollSelf` are open to any caller (the latter needs a
//! token from a recognized `Verify`); every other mutation is admin-only.

use std::sync::Arc;

use facegate_core::{AuthCollaborator, ErrorClass, FaceError, FaceIdentityService};
use serde_json::{json, Value};
use zbus::message::Header;
use zbus::{fdo, interface, Connection};

use crate::tokens::SessionTokens;

pub const BUS_NAME: &str = "org.facegate.Identity1";
pub const OBJECT_PATH: &str = "/org/facegate/Identity1";

/// Who may call the admin methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminPolicy {
    /// Only uid 0 (system bus).
    RootOnly,
    /// Everyone on the bus (session bus, single-user development setups).
    AnyCaller,
}

impl AdminPolicy {
    fn permits(&self, uid: u32) -> bool {
        match self {
            AdminPolicy::RootOnly => uid == 0,
            AdminPolicy::AnyCaller => true,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error(transparent)]
    Face(#[from] FaceError),
    #[error("access denied: {0}")]
    Denied(String),
}

impl From<CallError> for fdo::Error {
    fn from(err: CallError) -> Self {
        let msg = err.to_string();
        match err {
            CallError::Denied(_) => fdo::Error::AccessDenied(msg),
            CallError::Face(FaceError::Timeout { .. }) => fdo::Error::Timeout(msg),
            CallError::Face(face) => match face.class() {
                ErrorClass::Input | ErrorClass::Policy => fdo::Error::InvalidArgs(msg),
                ErrorClass::NotFound => fdo::Error::UnknownObject(msg),
                ErrorClass::Infrastructure => fdo::Error::Failed(msg),
            },
        }
    }
}

pub struct IdentityService {
    service: Arc<FaceIdentityService>,
    tokens: Arc<SessionTokens>,
    admin: AdminPolicy,
}

impl IdentityService {
    pub fn new(service: Arc<FaceIdentityService>, tokens: Arc<SessionTokens>, admin: AdminPolicy) -> Self {
        Self {
            service,
            tokens,
            admin,
        }
    }

    async fn run_verify(&self, image: &[u8]) -> Result<Value, CallError> {
        let verdict = self.service.verify(image).await?;
        let token = match verdict.user_key.filter(|_| verdict.recognized) {
            Some(user_key) => Some(
                self.tokens
                    .issue_token(user_key)
                    .await
                    .map_err(FaceError::from)?,
            ),
            None => None,
        };
        Ok(json!({
            "recognized": verdict.recognized,
            "user_key": verdict.user_key,
            "confidence": verdict.confidence,
            "message": verdict.message,
            "faces_detected": verdict.faces_detected,
            "matched_face": verdict.matched_face,
            "access_token": token,
        }))
    }

    async fn run_enroll_self(&self, token: &str, image: &[u8]) -> Result<Value, CallError> {
        let user_key = self
            .tokens
            .resolve(token)
            .await
            .map_err(FaceError::from)?
            .ok_or_else(|| CallError::Denied("session token is invalid or expired".into()))?;
        let outcome = self.service.enroll_self(user_key, image).await?;
        Ok(json!(outcome))
    }

    async fn run_enroll_as_admin(&self, user_key: i64, image: &[u8]) -> Result<Value, CallError> {
        let outcome = self.service.enroll_as_admin(user_key, image).await?;
        Ok(json!(outcome))
    }

    async fn run_status(&self) -> Result<Value, CallError> {
        let collection = self.service.status().await?;
        let settings = self.service.settings();
        Ok(json!({
            "version": env!("CARGO_PKG_VERSION"),
            "collection": collection,
            "embedding_dimension": settings.embedding_dimension,
            "match_threshold": settings.match_threshold,
            "allow_duplicate_faces": settings.allow_duplicate_faces,
        }))
    }

    /// Reject the call unless the sender passes the admin policy.
    async fn require_admin(&self, conn: &Connection, header: &Header<'_>) -> fdo::Result<()> {
        if self.admin == AdminPolicy::AnyCaller {
            return Ok(());
        }
        let sender = header
            .sender()
            .ok_or_else(|| fdo::Error::AccessDenied("message has no sender".into()))?;
        let dbus = fdo::DBusProxy::new(conn).await?;
        let uid = dbus.get_connection_unix_user(sender.clone().into()).await?;
        if !self.admin.permits(uid) {
            tracing::warn!(uid, "admin call rejected");
            return Err(CallError::Denied(format!("uid {uid} is not an administrator")).into());
        }
        Ok(())
    }
}

#[interface(name = "org.facegate.Identity1")]
impl IdentityService {
    /// Identify the face in `image`. A recognized caller receives a session token.
    async fn verify(&self, image: Vec<u8>) -> fdo::Result<String> {
        tracing::debug!(bytes = image.len(), "verify requested");
        Ok(self.run_verify(&image).await?.to_string())
    }

    /// Replace the caller's own face, identified by a token from `Verify`.
    async fn enroll_self(&self, token: &str, image: Vec<u8>) -> fdo::Result<String> {
        tracing::debug!(bytes = image.len(), "self enrollment requested");
        Ok(self.run_enroll_self(token, &image).await?.to_string())
    }

    async fn enroll_as_admin(
        &self,
        #[zbus(connection)] conn: &Connection,
        #[zbus(header)] header: Header<'_>,
        user_key: i64,
        image: Vec<u8>,
    ) -> fdo::Result<String> {
        self.require_admin(conn, &header).await?;
        tracing::info!(user_key, "admin enrollment requested");
        Ok(self.run_enroll_as_admin(user_key, &image).await?.to_string())
    }

    /// Remove a user's face. Returns whether one was enrolled.
    async fn reset_face(
        &self,
        #[zbus(connection)] conn: &Connection,
        #[zbus(header)] header: Header<'_>,
        user_key: i64,
    ) -> fdo::Result<bool> {
        self.require_admin(conn, &header).await?;
        Ok(self.service.reset_face(user_key).await.map_err(CallError::from)?)
    }

    /// Remove several users' faces. Returns how many were enrolled.
    async fn reset_faces(
        &self,
        #[zbus(connection)] conn: &Connection,
        #[zbus(header)] header: Header<'_>,
        user_keys: Vec<i64>,
    ) -> fdo::Result<u32> {
        self.require_admin(conn, &header).await?;
        let removed = self.service.reset_faces(&user_keys).await.map_err(CallError::from)?;
        Ok(u32::try_from(removed).unwrap_or(u32::MAX))
    }

    async fn has_face(
        &self,
        #[zbus(connection)] conn: &Connection,
        #[zbus(header)] header: Header<'_>,
        user_key: i64,
    ) -> fdo::Result<bool> {
        self.require_admin(conn, &header).await?;
        Ok(self.service.has_face(user_key).await.map_err(CallError::from)?)
    }

    /// Daemon and collection status as JSON.
    async fn status(&self) -> fdo::Result<String> {
        Ok(self.run_status().await?.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::sqlite_index::SqliteIndex;
    use crate::users::SqliteUserStore;
    use async_trait::async_trait;
    use facegate_core::{
        BoundingBox, CapabilityError, Collaborators, CoreSettings, Embedding, EmbeddingExtractor, FaceDetector,
        FaceRegion, IndexError, StoreError,
    };
    use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;
    use std::time::Duration;

    const DIM: usize = 4;

    /// Every non-black pixel is a face; its red value picks a one-hot embedding.
    struct PixelVision;

    #[async_trait]
    impl FaceDetector for PixelVision {
        async fn detect(&self, image: Arc<RgbImage>) -> Result<Vec<FaceRegion>, CapabilityError> {
            Ok(image
                .enumerate_pixels()
                .filter(|(_, _, p)| p.0 != [0, 0, 0])
                .map(|(x, y, p)| FaceRegion {
                    bbox: BoundingBox {
                        x: x as f32,
                        y: y as f32,
                        width: 1.0,
                        height: 1.0,
                        confidence: 0.9,
                        landmarks: None,
                    },
                    crop: RgbImage::from_pixel(1, 1, *p),
                    origin: (x, y),
                })
                .collect())
        }
    }

    #[async_trait]
    impl EmbeddingExtractor for PixelVision {
        async fn extract(&self, regions: Vec<FaceRegion>) -> Result<Vec<Embedding>, CapabilityError> {
            Ok(regions
                .iter()
                .map(|r| {
                    let mut v = vec![0.0; DIM];
                    v[r.crop.get_pixel(0, 0).0[0] as usize % DIM] = 1.0;
                    Embedding::new(v)
                })
                .collect())
        }
    }

    fn png(faces: &[[u8; 3]]) -> Vec<u8> {
        let img = RgbImage::from_fn(faces.len().max(1) as u32, 1, |x, _| {
            Rgb(faces.get(x as usize).copied().unwrap_or([0, 0, 0]))
        });
        let mut buf = Vec::new();
        DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .unwrap();
        buf
    }

    async fn daemon() -> (IdentityService, i64, i64) {
        let conn = db::open_in_memory().await;
        let users = SqliteUserStore::new(conn.clone());
        let admin = users.bootstrap_admin("admin").await.unwrap();
        let alice = users.ensure_user("alice", false).await.unwrap();

        let service = FaceIdentityService::new(
            Collaborators {
                detector: Arc::new(PixelVision),
                extractor: Arc::new(PixelVision),
                index: Arc::new(SqliteIndex::new(conn.clone(), DIM)),
                users: Arc::new(users),
            },
            CoreSettings {
                embedding_dimension: DIM,
                ..CoreSettings::default()
            },
        );
        let tokens = SessionTokens::new(conn, chrono::Duration::minutes(5));
        let iface = IdentityService::new(Arc::new(service), Arc::new(tokens), AdminPolicy::AnyCaller);
        (iface, admin, alice)
    }

    #[tokio::test]
    async fn test_verify_unknown_face_has_no_token() {
        let (iface, _, _) = daemon().await;
        let reply = iface.run_verify(&png(&[[1, 0, 0]])).await.unwrap();
        assert_eq!(reply["recognized"], false);
        assert!(reply["access_token"].is_null());
        assert_eq!(reply["faces_detected"], 1);
    }

    #[tokio::test]
    async fn test_verify_then_enroll_self_with_token() {
        let (iface, _, alice) = daemon().await;
        iface.run_enroll_as_admin(alice, &png(&[[1, 0, 0]])).await.unwrap();

        let reply = iface.run_verify(&png(&[[1, 0, 0]])).await.unwrap();
        assert_eq!(reply["recognized"], true);
        assert_eq!(reply["user_key"], alice);
        assert_eq!(reply["access_token"]["token_type"], "Bearer");
        let token = reply["access_token"]["token"].as_str().unwrap().to_string();

        // Alice moves her enrollment onto a new face using her token.
        let outcome = iface.run_enroll_self(&token, &png(&[[2, 0, 0]])).await.unwrap();
        assert_eq!(outcome["replaced"], true);
        assert_eq!(outcome["embedding_ref"]["user_key"], alice);

        let old = iface.run_verify(&png(&[[1, 0, 0]])).await.unwrap();
        assert_eq!(old["recognized"], false);
    }

    #[tokio::test]
    async fn test_enroll_self_rejects_bad_token() {
        let (iface, _, _) = daemon().await;
        let err = iface.run_enroll_self("forged", &png(&[[1, 0, 0]])).await.unwrap_err();
        assert!(matches!(err, CallError::Denied(_)));
        assert!(matches!(fdo::Error::from(err), fdo::Error::AccessDenied(_)));
    }

    #[tokio::test]
    async fn test_enroll_unknown_user_is_unknown_object() {
        let (iface, _, _) = daemon().await;
        let err = iface.run_enroll_as_admin(404, &png(&[[1, 0, 0]])).await.unwrap_err();
        assert!(matches!(fdo::Error::from(err), fdo::Error::UnknownObject(_)));
    }

    #[tokio::test]
    async fn test_status_reports_collection() {
        let (iface, admin, _) = daemon().await;
        iface.run_enroll_as_admin(admin, &png(&[[3, 0, 0]])).await.unwrap();
        let status = iface.run_status().await.unwrap();
        assert_eq!(status["collection"]["collection"], "face_features");
        assert_eq!(status["collection"]["state"], "ready");
        assert_eq!(status["collection"]["embeddings"], 1);
        assert_eq!(status["embedding_dimension"], DIM);
    }

    #[test]
    fn test_error_mapping() {
        let map = |e: FaceError| fdo::Error::from(CallError::from(e));
        assert!(matches!(map(FaceError::NoFaceDetected), fdo::Error::InvalidArgs(_)));
        assert!(matches!(map(FaceError::DuplicateFace), fdo::Error::InvalidArgs(_)));
        assert!(matches!(map(FaceError::UserNotFound(1)), fdo::Error::UnknownObject(_)));
        assert!(matches!(
            map(FaceError::IndexUnavailable(IndexError::Backend("down".into()))),
            fdo::Error::Failed(_)
        ));
        assert!(matches!(
            map(FaceError::StoreUnavailable(StoreError::Backend("down".into()))),
            fdo::Error::Failed(_)
        ));
        assert!(matches!(
            map(FaceError::Timeout {
                stage: facegate_core::Stage::Detect,
                after: Duration::from_secs(5)
            }),
            fdo::Error::Timeout(_)
        ));
    }

    #[test]
    fn test_admin_policy() {
        assert!(AdminPolicy::RootOnly.permits(0));
        assert!(!AdminPolicy::RootOnly.permits(1000));
        assert!(AdminPolicy::AnyCaller.permits(1000));
    }
}
