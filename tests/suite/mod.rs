mod build_id;
mod kernel;
mod process;
