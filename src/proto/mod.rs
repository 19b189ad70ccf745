pub mod sf {
    pub mod substreams {
        pub mod v1 {
            include!("sf.substreams.v1.rs");
        }
        pub mod rpc {
            pub mod v2 {
                include!("sf.substreams.rpc.v2.rs");
            }
        }
        pub mod sink {
            pub mod database {
                pub mod v1 {
                    include!("sf.substreams.sink.database.v1.rs");
                }
            }
        }
    }
}
