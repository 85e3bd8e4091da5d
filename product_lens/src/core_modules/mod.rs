pub mod detection;
pub mod embedding_client;
pub mod image_normalizer;
pub mod region_cropper;
pub mod region_detector;
pub mod similarity_search;
pub mod utils;
