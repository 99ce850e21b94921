pub(crate) mod nlu;

pub(crate) use nlu::{NluClientConfig, NluSimilarityClient};
