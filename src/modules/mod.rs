pub mod nexus;
