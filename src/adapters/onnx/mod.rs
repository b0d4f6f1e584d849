pub mod detr_engine;
pub mod model_catalog;
