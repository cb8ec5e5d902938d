#![no_main]

use libfuzzer_sys::fuzz_target;
use dotshim::{
    rewriter::{rewrite_module, CallSiteRewriter, RewriteOptions},
    Module,
};

fuzz_target!(|data: &[u8]| {
    if let Ok(mut module) = Module::from_mem(data.to_vec()) {
        let options = RewriteOptions::default();
        let mut rewriter = CallSiteRewriter::new(options.clone());
        if rewrite_module(&mut module, &mut rewriter, &options).is_ok() {
            let _ = module.to_bytes();
        }
    }
});
