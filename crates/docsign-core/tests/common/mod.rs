//! Shared fixtures for the engine integration tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{Duration, Utc};
use docsign_core::collector::AnnotationInput;
use docsign_core::notify::Vars;
use docsign_core::{
    AnnotationData, BlobStore, EngineConfig, Expect, Field, FieldType, MemoryStore, NewSession,
    Notification, Notifier, Recipient, RecipientRole, Session, SessionRepository, SigningEngine,
    SigningLink, StoreError, TokenIssuer, Versioned,
};
use lopdf::{dictionary, Document, Object};

pub const OWNER: &str = "owner@example.com";
pub const SECRET: &str = "integration-test-secret-0123456789abcdef";

pub fn test_pdf(pages: u32) -> Vec<u8> {
    let mut doc = Document::with_version("1.7");
    let pages_id = doc.new_object_id();
    let kids: Vec<Object> = (0..pages)
        .map(|_| {
            Object::Reference(doc.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => Object::Reference(pages_id),
                "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
            }))
        })
        .collect();
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => i64::from(pages),
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => Object::Reference(pages_id),
    });
    doc.trailer.set("Root", Object::Reference(catalog_id));

    let mut buffer = Vec::new();
    doc.save_to(&mut buffer).unwrap();
    buffer
}

pub fn png_data_url() -> String {
    let mut png_bytes = Vec::new();
    {
        let mut encoder = png::Encoder::new(&mut png_bytes, 2, 2);
        encoder.set_color(png::ColorType::Rgba);
        encoder.set_depth(png::BitDepth::Eight);
        let mut writer = encoder.write_header().unwrap();
        writer
            .write_image_data(&[
                0, 0, 0, 255, 0, 0, 0, 0, 0, 0, 0, 128, 10, 20, 30, 255,
            ])
            .unwrap();
    }
    format!("data:image/png;base64,{}", BASE64.encode(&png_bytes))
}

pub fn field(id: &str, field_type: FieldType, recipient_id: &str, page: u32) -> Field {
    Field {
        id: id.into(),
        field_type,
        recipient_id: recipient_id.into(),
        page,
        x_percent: 12.5,
        y_percent: 80.0,
        width_percent: 25.0,
        height_percent: 6.0,
        required: true,
    }
}

/// Two signers (one with a mixed-case email) and a cc on a two page document
pub fn new_session() -> NewSession {
    NewSession {
        document_name: "contract.pdf".into(),
        document_alias: None,
        base_document: test_pdf(2),
        recipients: vec![
            Recipient::new("r1", "Alice", "alice@example.com", RecipientRole::Signer),
            Recipient::new("r2", "Bob", "Bob@Example.com", RecipientRole::Signer),
            Recipient::new("r3", "Carol", "carol@example.com", RecipientRole::Cc),
        ],
        fields: vec![
            field("sig-alice", FieldType::Signature, "r1", 1),
            field("date-alice", FieldType::Date, "r1", 1),
            field("sig-bob", FieldType::Signature, "r2", 2),
        ],
        owner_email: OWNER.into(),
        expires_at: Utc::now() + Duration::days(7),
    }
}

/// A session with `n` signers, one signature field each
pub fn many_signers(n: usize) -> NewSession {
    let recipients = (0..n)
        .map(|i| {
            Recipient::new(
                format!("r{}", i),
                format!("Signer {}", i),
                format!("signer{}@example.com", i),
                RecipientRole::Signer,
            )
        })
        .collect();
    let fields = (0..n)
        .map(|i| {
            let mut f = field(&format!("f{}", i), FieldType::Signature, &format!("r{}", i), 1);
            f.y_percent = (i as f64 * 9.0) % 90.0;
            f
        })
        .collect();
    NewSession {
        recipients,
        fields,
        ..new_session()
    }
}

pub fn batch_for(session: &Session, recipient_id: &str) -> Vec<AnnotationInput> {
    session
        .fields
        .iter()
        .filter(|f| f.recipient_id == recipient_id)
        .map(|f| AnnotationInput {
            field_id: f.id.clone(),
            data: match f.field_type {
                FieldType::Signature | FieldType::Initials => AnnotationData::DrawnSignature {
                    image: png_data_url(),
                },
                FieldType::Text => AnnotationData::Text {
                    value: "Suite 300".into(),
                },
                FieldType::Date => AnnotationData::Date {
                    value: "2026-02-01".into(),
                },
                FieldType::Checkbox => AnnotationData::Checkbox { checked: true },
            },
        })
        .collect()
}

pub fn token_of(links: &[SigningLink], recipient_id: &str) -> String {
    let link = links
        .iter()
        .find(|l| l.recipient_id == recipient_id)
        .expect("link for recipient");
    link.signing_url
        .split("token=")
        .nth(1)
        .expect("token in url")
        .to_string()
}

pub fn token_from_url(url: &str) -> String {
    url.split("token=").nth(1).expect("token in url").to_string()
}

// ============================================================
// Collaborator doubles
// ============================================================

/// Memory store with switchable faults
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    fail_puts: AtomicBool,
    fail_prefix: Mutex<Option<String>>,
    conflicts: AtomicUsize,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every write fails with `Unavailable` while set
    pub fn set_outage(&self, down: bool) {
        self.fail_puts.store(down, Ordering::SeqCst);
    }

    /// Writes to keys with this prefix fail with `Unavailable`
    pub fn fail_writes_with_prefix(&self, prefix: Option<&str>) {
        *self.fail_prefix.lock().unwrap() = prefix.map(str::to_string);
    }

    /// The next `n` conditional writes report a conflict
    pub fn inject_conflicts(&self, n: usize) {
        self.conflicts.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl BlobStore for FlakyStore {
    async fn get(&self, key: &str) -> Result<Option<Versioned<Vec<u8>>>, StoreError> {
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, value: Vec<u8>, expect: Expect) -> Result<u64, StoreError> {
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected outage".into()));
        }
        if let Some(ref prefix) = *self.fail_prefix.lock().unwrap() {
            if key.starts_with(prefix.as_str()) {
                return Err(StoreError::Unavailable(format!("injected fault on {}", key)));
            }
        }
        if matches!(expect, Expect::Version(_))
            && self
                .conflicts
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return Err(StoreError::Conflict {
                key: key.to_string(),
            });
        }
        self.inner.put(key, value, expect).await
    }
}

/// Notifier that records what it was asked to send
#[derive(Default)]
pub struct RecordingNotifier {
    pub sent: Mutex<Vec<(String, Notification, Vars)>>,
}

impl RecordingNotifier {
    pub fn count(&self, template: Notification) -> usize {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, t, _)| *t == template)
            .count()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, to: &str, template: Notification, vars: &Vars) -> Result<(), String> {
        self.sent
            .lock()
            .unwrap()
            .push((to.to_string(), template, vars.clone()));
        Ok(())
    }
}

pub struct Harness {
    pub engine: SigningEngine,
    pub store: Arc<FlakyStore>,
    pub repo: SessionRepository,
    pub notifier: Arc<RecordingNotifier>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let store = Arc::new(FlakyStore::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let tokens = TokenIssuer::new(SECRET, "https://sign.example.com");
        let engine = SigningEngine::new(store.clone(), tokens, notifier.clone(), config);
        Self {
            engine,
            repo: SessionRepository::new(store.clone()),
            store,
            notifier,
        }
    }

    pub async fn session(&self, session_id: &str) -> Session {
        self.repo.get(session_id).await.unwrap().value
    }
}
