use hostblock::Config;

pub fn execute(config: &Config) -> anyhow::Result<()> {
    print!("{}", config.print());
    Ok(())
}
