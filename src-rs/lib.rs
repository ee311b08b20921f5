//! Ask a vision-language model a question about an image.
//!
//! A request runs four stages in order: [`raster::normalize`] decodes and bounds the input,
//! [`region::select_region`] crops it to the last drawn rectangle, [`codec::QueryBuilder`]
//! encodes it into a multimodal prompt, and [`executor::VisionClient`] sends that prompt once.
//! [`Pipeline`] strings them together.

pub mod codec;
pub mod error;
pub mod executor;
pub mod raster;
pub mod region;

pub use codec::{encode, encode_png, QueryBuilder, TransportBlob, VisionQuery};
pub use error::{Result, VisionError};
pub use executor::{
    ChatRequest, ClientConfig, HttpTransport, Transport, VisionAnswer, VisionClient,
};
pub use raster::{normalize, Image};
pub use region::{
    crop, parse_annotations, resolve_region, select_region, AnnotationEvent, CropRegion,
    ShapeKind,
};

/// The image after normalization and cropping.
#[derive(Debug, Clone)]
pub struct PreparedImage {
    /// Dimensions after normalization, before cropping.
    pub normalized_size: (u32, u32),
    pub region: Option<CropRegion>,
    pub image: Image,
}

/// Normalize and crop without encoding anything.
pub fn prepare_image(
    raw: &[u8],
    annotations: &[AnnotationEvent],
    max_width: Option<u32>,
) -> Result<PreparedImage> {
    let normalized = normalize(raw, max_width)?;
    let normalized_size = normalized.dimensions();
    let region = resolve_region(&normalized, annotations)?;
    let image = match region {
        Some(selected) => crop(&normalized, selected),
        None => normalized,
    };
    Ok(PreparedImage {
        normalized_size,
        region,
        image,
    })
}

/// Output of the offline stages: the image that will be sent and the query wrapping it.
#[derive(Debug, Clone)]
pub struct PreparedQuery {
    pub image: PreparedImage,
    pub query: VisionQuery,
}

/// Normalize, crop and encode without contacting the model.
pub fn prepare(
    raw: &[u8],
    annotations: &[AnnotationEvent],
    question: &str,
    max_width: Option<u32>,
    builder: &QueryBuilder,
) -> Result<PreparedQuery> {
    let image = prepare_image(raw, annotations, max_width)?;
    let query = builder.build(&image.image, question)?;
    Ok(PreparedQuery { image, query })
}

#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub answer: VisionAnswer,
    /// The image the model saw, kept for preview or download.
    pub image: PreparedImage,
}

/// One configured image-question-answer flow.
#[derive(Debug, Clone)]
pub struct Pipeline<T = HttpTransport> {
    max_width: Option<u32>,
    builder: QueryBuilder,
    client: VisionClient<T>,
}

impl<T: Transport> Pipeline<T> {
    pub fn new(max_width: Option<u32>, builder: QueryBuilder, client: VisionClient<T>) -> Self {
        Self {
            max_width,
            builder,
            client,
        }
    }

    pub fn client(&self) -> &VisionClient<T> {
        &self.client
    }

    pub fn prepare(
        &self,
        raw: &[u8],
        annotations: &[AnnotationEvent],
        question: &str,
    ) -> Result<PreparedQuery> {
        prepare(raw, annotations, question, self.max_width, &self.builder)
    }

    /// Send a prepared query. The query is consumed.
    pub fn execute(&self, prepared: PreparedQuery) -> Result<PipelineOutput> {
        let answer = self.client.execute(prepared.query)?;
        Ok(PipelineOutput {
            answer,
            image: prepared.image,
        })
    }

    /// Run every stage and return the model's answer along with the image it was given.
    pub fn run(
        &self,
        raw: &[u8],
        annotations: &[AnnotationEvent],
        question: &str,
    ) -> Result<PipelineOutput> {
        let prepared = self.prepare(raw, annotations, question)?;
        self.execute(prepared)
    }
}
