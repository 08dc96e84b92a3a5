//! Document signing session engine
//!
//! Owns the lifecycle of a multi-party signing transaction: creation,
//! per-recipient annotation batches, completion, voiding, revision and
//! restart. Sessions are stored as one versioned record each on a store
//! without cross-record transactions; the signed artifact is merged on demand
//! from the immutable base document and the collected annotations.

pub mod audit;
pub mod collector;
pub mod coords;
pub mod dashboard;
pub mod download;
pub mod engine;
pub mod error;
pub mod merger;
pub mod model;
pub mod notify;
pub mod repository;
pub mod state_machine;
pub mod store;
pub mod tokens;

pub use collector::{AnnotationInput, SubmitOutcome};
pub use dashboard::{Dashboard, DashboardIndexEntry, DashboardIndexer, InboxView, SentView};
pub use download::{Artifact, DownloadService};
pub use engine::{CreatedSession, EngineConfig, SigningEngine, SigningView, SubmitResult};
pub use error::{MergeError, Result, SigningError, StoreError};
pub use model::{
    Annotation, AnnotationData, Field, FieldType, Recipient, RecipientRole, Session,
    SessionStatus,
};
pub use notify::{Notification, Notifier, TracingNotifier};
pub use repository::SessionRepository;
pub use state_machine::{LifecyclePolicy, NewSession};
pub use store::{BlobStore, Expect, MemoryStore, Versioned};
pub use tokens::{DownloadRef, SigningLink, TokenIssuer};

#[cfg(test)]
pub(crate) mod test_support {
    use chrono::{Duration, Utc};
    use lopdf::{dictionary, Document, Object};

    use crate::collector::AnnotationInput;
    use crate::model::{AnnotationData, Field, FieldType, Recipient, RecipientRole, Session};
    use crate::state_machine::{create, NewSession};

    pub const OWNER: &str = "owner@example.com";

    pub fn field(id: &str, field_type: FieldType, recipient_id: &str, page: u32) -> Field {
        Field {
            id: id.into(),
            field_type,
            recipient_id: recipient_id.into(),
            page,
            x_percent: 10.0,
            y_percent: 70.0,
            width_percent: 30.0,
            height_percent: 5.0,
            required: true,
        }
    }

    /// Minimal US Letter PDF with the given number of blank pages
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

    /// 4x2 RGBA signature image as a data URL
    pub fn png_data_url() -> String {
        use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

        let mut png_bytes = Vec::new();
        {
            let mut encoder = png::Encoder::new(&mut png_bytes, 4, 2);
            encoder.set_color(png::ColorType::Rgba);
            encoder.set_depth(png::BitDepth::Eight);
            let mut writer = encoder.write_header().unwrap();
            let pixels: Vec<u8> = (0..8u8).flat_map(|i| [0, 0, i * 10, 255 - i]).collect();
            writer.write_image_data(&pixels).unwrap();
        }
        format!("data:image/png;base64,{}", BASE64.encode(&png_bytes))
    }

    pub fn sample_new_session() -> NewSession {
        let mut optional = field("f4", FieldType::Checkbox, "r2", 1);
        optional.required = false;
        NewSession {
            document_name: "lease.pdf".into(),
            document_alias: None,
            base_document: test_pdf(2),
            recipients: vec![
                Recipient::new("r1", "Alice", "alice@example.com", RecipientRole::Signer),
                Recipient::new("r2", "Bob", "Bob@Example.com", RecipientRole::Signer),
                Recipient::new("r3", "Carol", "carol@example.com", RecipientRole::Cc),
            ],
            fields: vec![
                field("f1", FieldType::Signature, "r1", 1),
                field("f2", FieldType::Date, "r1", 1),
                field("f3", FieldType::Signature, "r2", 2),
                optional,
            ],
            owner_email: OWNER.into(),
            expires_at: Utc::now() + Duration::hours(168),
        }
    }

    pub fn sample_session() -> Session {
        create(sample_new_session(), Utc::now()).unwrap()
    }

    /// A batch filling every field assigned to `recipient_id`
    pub fn full_batch(session: &Session, recipient_id: &str) -> Vec<AnnotationInput> {
        session
            .fields
            .iter()
            .filter(|f| f.recipient_id == recipient_id)
            .map(|f| AnnotationInput {
                field_id: f.id.clone(),
                data: match f.field_type {
                    FieldType::Signature | FieldType::Initials => AnnotationData::TypedSignature {
                        text: format!("Signer {}", recipient_id),
                        font: "Dancing Script".into(),
                    },
                    FieldType::Text => AnnotationData::Text {
                        value: "Apartment 4B".into(),
                    },
                    FieldType::Date => AnnotationData::Date {
                        value: "2026-01-15".into(),
                    },
                    FieldType::Checkbox => AnnotationData::Checkbox { checked: true },
                },
            })
            .collect()
    }
}
