pub mod localci {
    pub mod agent {
        pub mod v1 {
            tonic::include_proto!("localci.agent.v1");
        }
    }
}

pub use localci::agent::v1 as agent;
