mod test_builder;
mod test_em;
mod test_emd;
