pub mod transfer_models;
