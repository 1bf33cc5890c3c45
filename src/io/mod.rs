pub mod alignments;
pub mod model_file;
pub mod run_info;
pub mod site_info;
